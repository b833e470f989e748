pub mod allocate;
pub mod run;
