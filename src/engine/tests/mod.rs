pub mod helpers;
mod tests_tx;
