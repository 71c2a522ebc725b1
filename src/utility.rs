pub fn aligned_size_u64(value: u64, alignment: u64) -> u64 {
    assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_size_rounds_up_to_alignment() {
        assert_eq!(aligned_size_u64(32, 64), 64);
        assert_eq!(aligned_size_u64(64, 64), 64);
        assert_eq!(aligned_size_u64(65, 64), 128);
        assert_eq!(aligned_size_u64(1, 256), 256);
        assert_eq!(aligned_size_u64(0, 256), 0);
    }

    #[test]
    #[should_panic]
    fn aligned_size_rejects_non_power_of_two() {
        aligned_size_u64(10, 24);
    }
}
