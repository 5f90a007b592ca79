use elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{AffinePoint, EncodedPoint, NistP256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::PgpCurve;

impl PgpCurve for NistP256 {
    const NAME: &'static str = "NIST P-256";
    const BITS: usize = 256;
    // 1.2.840.10045.3.1.7
    const OID: &'static [u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07];

    fn encode_point(point: &AffinePoint) -> Vec<u8> {
        point.to_encoded_point(false).as_bytes().to_vec()
    }

    fn decode_point(bytes: &[u8]) -> Option<AffinePoint> {
        let encoded = EncodedPoint::from_bytes(bytes).ok()?;
        Option::from(AffinePoint::from_encoded_point(&encoded))
    }

    fn serialize_point<S: Serializer>(
        point: &AffinePoint,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        point.serialize(serializer)
    }

    fn deserialize_point<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<AffinePoint, D::Error> {
        AffinePoint::deserialize(deserializer)
    }
}
