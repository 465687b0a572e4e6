//! HTTP middleware.
pub mod auth;

pub use auth::{
    AuthContext, AuthError, AuthLayer, AuthService, Claims, IdentityVerifier, JwtVerifier,
    StaticTokenVerifier, VerifiedIdentity,
};
