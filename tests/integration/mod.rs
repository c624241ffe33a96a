//! Integration tests for the decompfs storage engine

mod cli;
mod revisions;
mod support;
mod tree;
mod uploads;
