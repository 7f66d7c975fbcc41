pub mod cfg;
mod constants;
