//! Token authentication: signing keys, validation and refresh.

pub mod keys;
pub mod provider;
pub mod refresh;
pub mod validator;

pub use keys::{HttpJwksSource, JwksSource, KeyFetchError, KeyResolver, SigningKey};
pub use provider::{HttpIdentityProvider, IdentityProvider, TokenResponse, UpstreamError};
pub use refresh::{RefreshError, RefreshOptions, RefreshTokenRegistry, TokenRefresher, TokenSet, needs_refresh};
pub use validator::{
    TokenType, TokenValidator, UserProfile, ValidationError, ValidationOptions, ValidationResult,
};
