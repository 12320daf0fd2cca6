/// Sums PCM sources into `out` with integer accumulation, saturating at
/// full scale. Integer sums make the result independent of source order.
pub fn mix_into<'a>(out: &mut [i16], sources: impl IntoIterator<Item = &'a [i16]>) {
    let mut accumulator = vec![0i32; out.len()];
    for source in sources {
        for (slot, sample) in accumulator.iter_mut().zip(source.iter()) {
            *slot += *sample as i32;
        }
    }
    for (slot, total) in out.iter_mut().zip(accumulator) {
        *slot = total.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
}
