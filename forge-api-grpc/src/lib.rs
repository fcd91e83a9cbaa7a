#[cfg(test)]
test_r::enable!();

#[allow(clippy::large_enum_variant)]
pub mod proto {
    tonic::include_proto!("mod");

    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("services");

    impl From<forge::common::Uuid> for uuid::Uuid {
        fn from(value: forge::common::Uuid) -> Self {
            uuid::Uuid::from_u64_pair(value.high_bits, value.low_bits)
        }
    }

    impl From<uuid::Uuid> for forge::common::Uuid {
        fn from(value: uuid::Uuid) -> Self {
            let (high_bits, low_bits) = value.as_u64_pair();
            Self {
                high_bits,
                low_bits,
            }
        }
    }
}
