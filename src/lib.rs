//! Client-side playback engine for a fixed playlist of audio tracks.
//!
//! The [`Player`](player::Player) keeps one current track, drives a single
//! [`Engine`](engine::Engine) and tracks play, pause, seek, volume and loop
//! state. The [`PrefetchManager`](prefetch::PrefetchManager) downloads
//! tracks ahead of demand into in-memory resources that playback prefers
//! over the network.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod audio_file;
pub mod command;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod player;
pub mod prefetch;
pub mod resources;
pub mod selection;
pub mod state;
pub mod track;

#[cfg(test)]
mod testing;
