//! Cloud Code account credentials and OAuth plumbing
//!
//! Everything needed to turn a stored refresh token into an authenticated
//! Cloud Code session, kept free of any rotation policy so it can be tested
//! on its own.
//!
//! Flow used by the quota probe:
//! 1. `CredentialStore::load()` reads the versioned account file
//! 2. `token::refresh_token()` trades a refresh token for an access token
//! 3. `project::load_code_assist()` discovers the companion project when the
//!    account has none cached
//! 4. `CredentialStore::save()` writes cooldowns back after rotation

pub mod constants;
pub mod credentials;
pub mod error;
pub mod project;
pub mod token;

pub use constants::*;
pub use credentials::{
    Account, AccountStorage, COOLDOWN_NEVER, CredentialStore, FamilyIndex, opencode_config_dir,
    write_atomic,
};
pub use error::{Error, Result};
pub use project::{extract_project_id, load_code_assist};
pub use token::{OAuthClient, TokenResponse, refresh_token};
