//! Middleware registration surface.
//!
//! A [`MiddlewareSpec`] is everything a host needs to know about a middleware
//! type: its tag, the flags it understands, and how to build it from a stored
//! record or from parsed flags.

use std::convert::Infallible;
use std::ffi::OsString;
use std::fmt;
use std::sync::Arc;

use axum::{body::Body, http::Request, response::Response};
use clap::{value_parser, Arg, ArgMatches, Command};
use thiserror::Error;
use tower::util::BoxCloneSyncService;

/// Type-erased handler, the unit a chain is assembled from.
pub type BoxHandler = BoxCloneSyncService<Request<Body>, Response, Infallible>;

/// Builds a middleware from a deserialized configuration record.
pub type FromRecordFn = fn(&serde_json::Value) -> Result<Arc<dyn Middleware>, MiddlewareError>;

/// Builds a middleware from flags parsed against [`MiddlewareSpec::command`].
pub type FromFlagsFn = fn(&ArgMatches) -> Result<Arc<dyn Middleware>, MiddlewareError>;

/// A configured middleware that can wrap the next handler in a chain.
pub trait Middleware: fmt::Display + fmt::Debug + Send + Sync {
    /// Wrap `next`, returning the handler to place in front of it.
    fn new_handler(&self, next: BoxHandler) -> BoxHandler;
}

/// Errors raised while constructing a middleware.
#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("invalid middleware record: {0}")]
    InvalidRecord(#[from] serde_json::Error),

    #[error("invalid middleware flags: {0}")]
    InvalidFlags(#[from] clap::Error),

    #[error("flag lookup failed: {0}")]
    FlagLookup(#[from] clap::parser::MatchesError),
}

/// Value kind of a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    Bool,
    String,
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagKind::Bool => write!(f, "bool"),
            FlagKind::String => write!(f, "string"),
        }
    }
}

/// One entry of a middleware's flag schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagSpec {
    pub name: &'static str,
    pub kind: FlagKind,
    pub default: &'static str,
    pub description: &'static str,
}

impl FlagSpec {
    /// Convert to a clap argument named `--<name>`.
    ///
    /// Bool flags accept `--name`, `--name=<true|false>` and
    /// `--name <true|false>`.
    pub fn to_arg(&self) -> Arg {
        let arg = Arg::new(self.name)
            .long(self.name)
            .help(self.description)
            .default_value(self.default);

        match self.kind {
            FlagKind::Bool => arg
                .value_parser(value_parser!(bool))
                .num_args(0..=1)
                .default_missing_value("true"),
            FlagKind::String => arg.value_parser(value_parser!(String)),
        }
    }
}

/// Static description of a middleware type, handed to a registry.
#[derive(Clone)]
pub struct MiddlewareSpec {
    /// Short unique name, e.g. `backendheader`.
    pub type_tag: &'static str,
    pub flags: Vec<FlagSpec>,
    pub from_record: FromRecordFn,
    pub from_flags: FromFlagsFn,
}

impl MiddlewareSpec {
    /// Clap command describing this middleware's flags, used for help output
    /// and for parsing.
    pub fn command(&self) -> Command {
        Command::new(self.type_tag)
            .args(self.flags.iter().map(FlagSpec::to_arg))
    }

    /// Parse raw CLI arguments (without a leading program name) and build the
    /// middleware from them.
    pub fn parse_flags<I, T>(&self, args: I) -> Result<Arc<dyn Middleware>, MiddlewareError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let argv = std::iter::once(OsString::from(self.type_tag))
            .chain(args.into_iter().map(Into::into));
        let matches = self.command().try_get_matches_from(argv)?;
        (self.from_flags)(&matches)
    }

    /// Build the middleware from a stored record.
    pub fn build_from_record(
        &self,
        record: &serde_json::Value,
    ) -> Result<Arc<dyn Middleware>, MiddlewareError> {
        (self.from_record)(record)
    }
}

impl fmt::Debug for MiddlewareSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareSpec")
            .field("type_tag", &self.type_tag)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}
