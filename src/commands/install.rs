//! `install`, `validate` and `uninstall`

use super::Session;
use crate::install::{installer_for, Installer};
use crate::Result;

fn installer(session: &Session) -> Box<dyn Installer> {
    let config = &session.config;
    installer_for(
        config.installer.kind,
        session.helm(),
        &config.chart,
        &config.operator,
        &config.sql,
    )
}

/// Install the configured component
pub async fn install(session: &Session) -> Result<()> {
    installer(session).install(&session.ctx).await
}

/// Validate the configured component
pub async fn validate(session: &Session) -> Result<()> {
    installer(session).validate(&session.ctx).await
}

/// Remove the configured component
pub async fn uninstall(session: &Session) -> Result<()> {
    installer(session).uninstall(&session.ctx).await
}
