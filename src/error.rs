use thiserror::Error;

/// Everything that can go wrong while turning raw records into profiles.
///
/// Only the separator and layout variants are fatal to a stream; address
/// rejection is an expected per-record condition (MAC-only records are
/// normal) and is handled by dropping the record, never by aborting.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The first delimited line split into the same number of fields with
    /// commas and with tabs, so no separator can be chosen.
    #[error("ambiguous delimiter: comma and tab yield the same field count")]
    AmbiguousSeparator,

    /// A column layout could never be established for the stream.
    #[error("cannot establish a column layout: {0}")]
    Layout(String),

    /// The record's source address is neither an IPv4 nor an IPv6 literal.
    #[error("source address is neither IPv4 nor IPv6: {0}")]
    AddressParse(String),
}

pub type Result<T> = std::result::Result<T, FlowError>;
