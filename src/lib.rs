pub mod auth;
pub mod config;
pub mod connection;
pub mod content;
pub mod game;
pub mod matchmaking;
pub mod monitoring;
pub mod schema;
pub mod settings;
pub mod state;
pub mod users;
pub mod validator;

#[cfg(test)]
pub mod test_support;

#[cfg(test)]
mod test;

use diesel_migrations::{EmbeddedMigrations, embed_migrations};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();
