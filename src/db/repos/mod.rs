pub mod access;
pub mod scenarios;
