pub mod health;
pub mod supervisor;
pub mod worker;
