//! Model routing: which provider serves a role, with which credentials.
//!
//! [`CredentialResolver`] classifies providers per publisher from the
//! environment, an opt-in AWS profile, and stored Claude Max tokens.
//! [`ModelRouter`] walks large-context and large-output fallbacks for a
//! prompt's size and binds the result to the first fully satisfied provider.

pub mod env;
pub mod oauth;
pub mod resolver;
pub mod router;

pub use env::{AuthEnv, MapEnv, ProcessEnv, maybe_load_json};
pub use oauth::{ClaudeMaxAuth, Pkce};
pub use resolver::{AuthStatus, CredentialCheck, CredentialResolver, ProviderStatus, PublisherStatus};
pub use router::{ModelRouter, Route, RoutedBy};
