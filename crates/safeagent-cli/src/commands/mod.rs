pub(crate) mod audit;
pub(crate) mod config;
pub(crate) mod run;
