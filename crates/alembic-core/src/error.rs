use thiserror::Error;

/// Errors raised by site installation and the emitter API.
///
/// Timeouts are not errors (timed blocking emits return `Ok(None)`), and a
/// refused pipelined emission is only reported, never raised.
#[derive(Error, Debug, Clone)]
pub enum ChemError {
    #[error("molecule '{0}' is not bound to any reaction site")]
    MoleculeNotBound(String),

    #[error("reaction '{0}' consumes no input molecules")]
    NoInputs(String),

    #[error("molecule '{molecule}' is already bound to reaction site '{site}'")]
    AlreadyBound { molecule: String, site: String },

    #[error("reaction '{reaction}' repeats input molecule '{molecule}' without the repeated-input flag")]
    NonlinearInput { reaction: String, molecule: String },

    #[error("identical repeated reactions in one site: '{0}'")]
    ShadowedReactions(String),

    #[error("unavoidable indeterminism: reaction '{weaker}' is irrefutably weaker than '{stronger}' over the same inputs")]
    UnavoidableIndeterminism { weaker: String, stronger: String },

    #[error("static molecule misuse: {0}")]
    StaticMisuse(String),

    #[error("reaction site '{0}' is inactive: its pool has shut down")]
    SiteInactive(String),

    #[error("blocking molecule '{molecule}' received no reply: {cause}")]
    NoReply { molecule: String, cause: String },

    #[error("molecule '{molecule}' does not carry a value of the requested type")]
    TypeMismatch { molecule: String },
}
