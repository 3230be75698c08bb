//! AuthRelay Token Domain
//!
//! The refresh-token security state machine and the service that drives it:
//! rotation, reuse detection, device binding and breach-chain revocation.
//! Every transition buffers domain events that are captured transactionally
//! into the outbox alongside the token rows.

pub mod domain;
pub mod events;
pub mod repository;
pub mod service;

pub use domain::{RefreshToken, TokenStatus};
pub use events::{token_event_registry, TokenEvent};
pub use repository::PgRefreshTokenRepository;
pub use service::{AccessTokenIssuer, IssuedTokens, InvalidRefresh, RefreshOutcome, RefreshService};
