//! Test modules for the beat crate

mod scheduler_tests;
