#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation
)]

pub mod agent;
pub mod audit;
pub mod bridge;
pub mod config;
pub mod deck;
pub mod error;
pub mod policy;
pub mod security;
pub mod transport;

pub use config::Config;
pub use deck::{Deck, DeckStatus};
pub use error::{Result, TetherError};
