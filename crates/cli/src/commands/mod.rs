//! CLI subcommands

pub mod profile;
