pub mod identity;
pub mod refresh;
pub mod session;
pub mod store;
pub mod terminal;

pub(crate) use identity::{GoogleOAuth, IdentityProvider, OAuthEndpoints};
pub(crate) use refresh::RefreshGuard;
pub(crate) use session::{Identity, SessionStore};
pub(crate) use store::{
    CredentialRecord, CredentialStore, Credentials, FileCredentialStore, MemoryCredentialStore,
};
pub(crate) use terminal::{ShellCommand, ShellLauncher};
