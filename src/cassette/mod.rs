//! Episodes, their on-disk encoding and cassette files

mod encoding;
mod episode;
mod store;

pub use encoding::{decode, encode};
pub use episode::{Body, BodyEncoding, Episode, Form, Headers, RecordedRequest, RecordedResponse, Target};
pub use store::{validate_cassette_name, CassetteStore};

/// Cassette file extension
pub const CASSETTE_EXTENSION: &str = "json";

/// Longest accepted cassette name, in bytes
pub const MAX_NAME_LEN: usize = 255;
