//! Library crate for study-arena-back: live multiplayer matches over WebSocket with a REST
//! control plane.

pub mod config;
pub mod dao;
pub mod dto;
pub mod error;
pub mod routes;
pub mod services;
pub mod state;
