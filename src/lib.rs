pub mod catalog;
pub mod cli;
pub mod format;
pub mod image;
pub mod report;
pub mod runner;
pub mod writer;

pub use runner::run;
