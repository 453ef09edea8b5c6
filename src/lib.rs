// src/lib.rs

pub mod calibration;
pub mod config;
pub mod connector;
pub mod error;
pub mod geometry;
pub mod pipeline;
pub mod replay;
pub mod traffic;
pub mod types;
