use elliptic_curve::Field;
use rand_core::CryptoRngCore;
use zeroize::Zeroize;

use crate::compat::PgpCurve;

/// Represents a polynomial with coefficients in the scalar field of the curve.
///
/// The coefficients are wiped when the polynomial is dropped, since every
/// polynomial in this crate hides a secret in its constant term.
#[derive(Clone)]
pub struct Polynomial<C: PgpCurve> {
    /// The coefficients of our polynomial, from 0..size-1.
    coefficients: Vec<C::Scalar>,
}

impl<C: PgpCurve> Polynomial<C> {
    /// Generate a random polynomial with a certain number of coefficients.
    pub fn random(rng: &mut impl CryptoRngCore, size: usize) -> Self {
        let coefficients = (0..size).map(|_| C::Scalar::random(&mut *rng)).collect();
        Self { coefficients }
    }

    /// Extend a constant to a random polynomial of a certain size.
    ///
    /// This is useful if you want the polynomial to have a certain value, but
    /// otherwise be random.
    pub fn extend_random(rng: &mut impl CryptoRngCore, size: usize, constant: &C::Scalar) -> Self {
        let mut coefficients = Vec::with_capacity(size);
        coefficients.push(*constant);
        for _ in 1..size {
            coefficients.push(C::Scalar::random(&mut *rng));
        }
        Self { coefficients }
    }

    /// A random polynomial of a certain size whose value at zero is zero.
    pub fn random_zero(rng: &mut impl CryptoRngCore, size: usize) -> Self {
        Self::extend_random(rng, size, &C::Scalar::ZERO)
    }

    /// Evaluate the polynomial at a point, using Horner's method.
    pub fn evaluate(&self, x: &C::Scalar) -> C::Scalar {
        let mut out = C::Scalar::ZERO;
        for c in self.coefficients.iter().rev() {
            out = out * x + c;
        }
        out
    }
}

impl<C: PgpCurve> Drop for Polynomial<C> {
    fn drop(&mut self) {
        self.coefficients.zeroize();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::participants::ParticipantList;
    use crate::protocol::Participant;
    use p256::{NistP256, Scalar};
    use rand_core::OsRng;

    #[test]
    fn test_evaluate() {
        let f = Polynomial::<NistP256> {
            coefficients: vec![Scalar::from(1u64), Scalar::from(2u64), Scalar::from(3u64)],
        };
        // 1 + 2 * 2 + 3 * 4
        assert_eq!(f.evaluate(&Scalar::from(2u64)), Scalar::from(17u64));
        assert_eq!(f.evaluate(&Scalar::ZERO), Scalar::from(1u64));
    }

    #[test]
    fn test_interpolation_recovers_secret() {
        let secret = Scalar::random(&mut OsRng);
        let f = Polynomial::<NistP256>::extend_random(&mut OsRng, 3, &secret);
        let participants: Vec<Participant> = vec![1u32.into(), 4u32.into(), 6u32.into()];
        let list = ParticipantList::new(&participants).unwrap();
        let mut acc = Scalar::ZERO;
        for p in &participants {
            acc += list.lagrange::<NistP256>(*p) * f.evaluate(&p.scalar::<NistP256>());
        }
        assert_eq!(acc, secret);
    }

    #[test]
    fn test_random_zero() {
        let f = Polynomial::<NistP256>::random_zero(&mut OsRng, 5);
        assert_eq!(f.coefficients.len(), 5);
        assert_eq!(f.evaluate(&Scalar::ZERO), Scalar::ZERO);
    }
}
