pub mod args;
pub mod demo;
pub mod tools;
