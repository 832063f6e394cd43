use serde::de::DeserializeOwned;
use serde::Serialize;

/// Turns typed values into the bytes handed to the store and back.
pub trait Codec<T> {
    type Error: std::error::Error + Send + Sync + 'static;

    fn encode(&self, value: &T) -> Result<Vec<u8>, Self::Error>;

    fn decode(&self, bytes: &[u8]) -> Result<T, Self::Error>;
}

/// serde_json, the default payload encoding. A value that serializes to
/// `null` has nothing to store and is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    type Error = serde_json::Error;

    fn encode(&self, value: &T) -> Result<Vec<u8>, serde_json::Error> {
        to_json(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// JSON bytes for `value`, refusing `null`.
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    if bytes == b"null" {
        return Err(serde::ser::Error::custom("payload is null"));
    }
    Ok(bytes)
}
