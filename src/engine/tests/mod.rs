pub mod helpers;

mod tests_basic;
mod tests_options;
mod tests_recovery;
