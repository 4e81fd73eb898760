//! # georecall
//!
//! Recall@N evaluation of image-retrieval and visual place-recognition
//! models: ResNet backbones with GeM, SPoC, MAC, R-MAC, NetVLAD or CRN
//! aggregation, off-the-shelf weights, optional PCA and multi-crop query
//! strategies.

pub mod cli;
pub mod commands;
pub mod config;
pub mod core;
pub mod evaluation;
pub mod models;
pub mod processing;
pub mod runtime;
pub mod storage;
pub mod ui;
