//! Item serialization for the pipe transport.
//!
//! Queue items cross the process boundary as postcard-encoded payloads.
//! Any process linking the same item type can decode any other's output;
//! the encoding carries no per-process state.

use serde::{Serialize, de::DeserializeOwned};

/// Marker trait for types that can travel through a queue.
///
/// Automatically implemented for all `Serialize + DeserializeOwned` types.
pub trait Wire: Serialize + DeserializeOwned {}
impl<T> Wire for T where T: Serialize + DeserializeOwned {}

/// Serialize an item into a fresh byte vector.
pub(crate) fn dumps<T: Wire>(item: &T) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec(item)
}

/// Deserialize an item from a received payload.
///
/// Callers run this after releasing any read lock so a slow decode does not
/// stall other consumers.
pub(crate) fn loads<T: Wire>(bytes: &[u8]) -> Result<T, postcard::Error> {
    postcard::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: u64,
        payload: String,
    }

    #[test]
    fn roundtrip_struct() {
        let job = Job {
            id: 7,
            payload: "resize".to_string(),
        };
        let bytes = dumps(&job).unwrap();
        let back: Job = loads(&bytes).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn decode_garbage_fails() {
        let result: Result<Job, _> = loads(&[0xff; 3]);
        assert!(result.is_err());
    }
}
