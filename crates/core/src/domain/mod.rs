pub mod actor;
pub mod agreement;
pub mod history;
pub mod mutation;
pub mod opportunity;
pub mod stage;
pub mod transition;
