//! Reply submission pipeline for imageboard clients.
//!
//! Accepts requests to post replies or new threads, runs them one at a time
//! through a single worker, reports live progress, supports cancellation and
//! respects per-board posting cooldowns.

pub mod config;
pub mod db;
pub mod drafts;
pub mod posting;
pub mod site;
pub mod target;
pub mod web;
