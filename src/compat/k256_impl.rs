use elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::{AffinePoint, EncodedPoint, Secp256k1};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::PgpCurve;

impl PgpCurve for Secp256k1 {
    const NAME: &'static str = "secp256k1";
    const BITS: usize = 256;
    // 1.3.132.0.10
    const OID: &'static [u8] = &[0x2B, 0x81, 0x04, 0x00, 0x0A];

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
