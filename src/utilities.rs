use futuresdr::num_complex::Complex32;
use ordered_float::OrderedFloat;
use rustfft::num_traits::Float;

pub const MIN_SF: usize = 6; //minimum and maximum SF
pub const MAX_SF: usize = 12;

/**
 *  \brief  return the modulus a % n between 0 and (n - 1)
 *
 *  Mixed-sign inputs take the non-negative representative, which the
 *  built-in `%` operator does not.
 */
#[inline]
pub fn mod_nonneg(a: i64, n: i64) -> i64 {
    ((a % n) + n) % n
}

/// Round half away from zero, as C `roundf` does.
#[inline]
pub fn my_roundf(number: f32) -> i32 {
    if number > 0.0 {
        (number + 0.5) as i32
    } else {
        (number - 0.5).ceil() as i32
    }
}

pub fn argmax_float<T: Float>(input_slice: &[T]) -> usize {
    input_slice
        .iter()
        .map(|x| OrderedFloat::<T>(*x))
        .enumerate()
        .max_by(|(_, value0), (_, value1)| value0.cmp(value1))
        .map(|(idx, _)| idx)
        .unwrap_or(0_usize)
}

pub fn volk_32fc_conjugate_32fc(a_vector: &[Complex32]) -> Vec<Complex32> {
    a_vector.iter().map(|x| x.conj()).collect()
}

pub fn volk_32fc_x2_multiply_32fc(
    input_slice_1: &[Complex32],
    input_slice_2: &[Complex32],
) -> Vec<Complex32> {
    input_slice_1
        .iter()
        .zip(input_slice_2.iter())
        .map(|(x, y)| x * y)
        .collect()
}

pub fn volk_32fc_magnitude_32f(input_slice: &[Complex32]) -> Vec<f32> {
    input_slice.iter().map(|x| x.norm()).collect()
}
