// ABOUTME: Library module for postgres-chunk-dump
// ABOUTME: Exports all core functionality for use in binary and tests

pub mod commands;
pub mod config;
pub mod database;
pub mod error;
pub mod postgres;
pub mod remote;
pub mod sql;
pub mod transfer;
pub mod utils;
