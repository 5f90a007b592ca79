use elliptic_curve::ScalarPrimitive;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};

use crate::compat::PgpCurve;

/// Encode an arbitrary serializable value into a vec.
pub fn encode<T: Serialize + ?Sized>(val: &T) -> Vec<u8> {
    rmp_serde::encode::to_vec(val).expect("failed to encode value")
}

/// Encode an arbitrary serializable value behind a fixed header.
pub fn encode_with_header<T: Serialize + ?Sized>(header: &[u8], val: &T) -> Vec<u8> {
    let mut out = header.to_vec();
    rmp_serde::encode::write(&mut out, val).expect("failed to encode value");
    out
}

/// Decode an arbitrary value from a slice of bytes.
pub fn decode<T: DeserializeOwned>(input: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::decode::from_slice(input)
}

/// Serialize a scalar through its canonical primitive form.
pub fn serialize_scalar<C: PgpCurve, S: Serializer>(
    data: &C::Scalar,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let data: ScalarPrimitive<C> = (*data).into();
    data.serialize(serializer)
}

/// Deserialize a scalar, rejecting values outside of the field.
pub fn deserialize_scalar<'de, C: PgpCurve, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<C::Scalar, D::Error> {
    let data = ScalarPrimitive::<C>::deserialize(deserializer)?;
    Ok(data.into())
}
