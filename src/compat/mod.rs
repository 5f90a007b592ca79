use elliptic_curve::{
    ops::Reduce, point::AffineCoordinates, Curve, CurveArithmetic, FieldBytes, PrimeCurve,
    PrimeField,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod k256_impl;
pub mod p256_impl;

/// Represents a curve usable for threshold OpenPGP keys.
///
/// The bulk of the trait are the bounds requiring a curve according
/// to RustCrypto's traits.
///
/// Beyond that, we also require the curve OID OpenPGP uses to name the curve,
/// the bit length of the group order (which decides the hash algorithm),
/// and SEC1 encoding of points, which is how OpenPGP stores them in MPIs.
pub trait PgpCurve: PrimeCurve + CurveArithmetic {
    const NAME: &'static str;

    /// The bit length of the group order.
    const BITS: usize;

    /// The curve OID, without its length prefix.
    const OID: &'static [u8];

    /// Encode a point in uncompressed SEC1 form.
    fn encode_point(point: &Self::AffinePoint) -> Vec<u8>;

    /// Decode a SEC1 point, rejecting anything not on the curve.
    fn decode_point(bytes: &[u8]) -> Option<Self::AffinePoint>;

    /// Serialize a point with serde.
    fn serialize_point<S: Serializer>(
        point: &Self::AffinePoint,
        serializer: S,
    ) -> Result<S::Ok, S::Error>;

    /// Deserialize a point with serde.
    fn deserialize_point<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self::AffinePoint, D::Error>;
}

/// The curves supported at runtime, used to dispatch on the OID of a loaded key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveKind {
    NistP256,
    Secp256k1,
}

impl CurveKind {
    pub fn from_oid(oid: &[u8]) -> Option<Self> {
        if oid == <p256::NistP256 as PgpCurve>::OID {
            Some(Self::NistP256)
        } else if oid == <k256::Secp256k1 as PgpCurve>::OID {
            Some(Self::Secp256k1)
        } else {
            None
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "p256" | "p-256" | "nistp256" => Some(Self::NistP256),
            "secp256k1" | "k256" => Some(Self::Secp256k1),
            _ => None,
        }
    }

    pub fn oid(&self) -> &'static [u8] {
        match self {
            Self::NistP256 => <p256::NistP256 as PgpCurve>::OID,
            Self::Secp256k1 => <k256::Secp256k1 as PgpCurve>::OID,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NistP256 => <p256::NistP256 as PgpCurve>::NAME,
            Self::Secp256k1 => <k256::Secp256k1 as PgpCurve>::NAME,
        }
    }

    /// The bit length of the group order.
    pub fn bits(&self) -> usize {
        match self {
            Self::NistP256 => <p256::NistP256 as PgpCurve>::BITS,
            Self::Secp256k1 => <k256::Secp256k1 as PgpCurve>::BITS,
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct SerializablePoint<C: PgpCurve>(C::AffinePoint);

impl<C: PgpCurve> SerializablePoint<C> {
    pub fn to_affine(self) -> C::AffinePoint {
        self.0
    }

    pub fn to_projective(self) -> C::ProjectivePoint {
        self.0.into()
    }

    pub fn from_affine(point: C::AffinePoint) -> Self {
        Self(point)
    }

    pub fn from_projective(point: &C::ProjectivePoint) -> Self {
        Self((*point).into())
    }
}

impl<C: PgpCurve> Serialize for SerializablePoint<C> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        C::serialize_point(&self.0, serializer)
    }
}

impl<'de, C: PgpCurve> Deserialize<'de> for SerializablePoint<C> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let affine = C::deserialize_point(deserializer)?;
        Ok(Self(affine))
    }
}

/// Get the x coordinate of a point, as a scalar
pub(crate) fn x_coordinate<C: PgpCurve>(point: &C::AffinePoint) -> C::Scalar {
    <C::Scalar as Reduce<<C as Curve>::Uint>>::reduce_bytes(&point.x())
}

/// Convert a message digest into the scalar ECDSA signs.
///
/// The digest is truncated to the size of the group order first, which
/// is what lets a SHA-512 digest be used with a 256 bit curve.
pub(crate) fn digest_to_scalar<C: PgpCurve>(digest: &[u8]) -> Option<C::Scalar> {
    let mut field_bytes = FieldBytes::<C>::default();
    let len = field_bytes.len();
    // Supported curves have byte aligned orders, so truncation needs no shift.
    if digest.len() < len / 2 {
        return None;
    }
    if digest.len() >= len {
        field_bytes.copy_from_slice(&digest[..len]);
    } else {
        field_bytes[len - digest.len()..].copy_from_slice(digest);
    }
    Some(<C::Scalar as Reduce<<C as Curve>::Uint>>::reduce_bytes(
        &field_bytes,
    ))
}

/// Big endian bytes of a scalar, padded to the field size.
pub(crate) fn scalar_to_bytes<C: PgpCurve>(scalar: &C::Scalar) -> Vec<u8> {
    let repr: FieldBytes<C> = (*scalar).into();
    repr.to_vec()
}

/// Parse big endian bytes (as found in an MPI) into a scalar.
pub(crate) fn scalar_from_bytes<C: PgpCurve>(bytes: &[u8]) -> Option<C::Scalar> {
    let mut repr = FieldBytes::<C>::default();
    let len = repr.len();
    if bytes.len() > len {
        return None;
    }
    repr[len - bytes.len()..].copy_from_slice(bytes);
    Option::from(C::Scalar::from_repr(repr))
}
