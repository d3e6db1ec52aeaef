//! Property-based tests for the growable buffer
//!
//! Random append sequences against the headless device: every offset is
//! role-aligned, growth never loses previously appended bytes, and the
//! growth policy always satisfies the request.

use super::tests::context;
use super::*;
use proptest::prelude::*;

fn any_role() -> impl Strategy<Value = BufferRole> {
    prop_oneof![
        Just(BufferRole::Vertex),
        Just(BufferRole::Index),
        Just(BufferRole::ShapeProperties),
        Just(BufferRole::Constant),
    ]
}

prop_compose! {
    fn append_sequence()(
        sizes in prop::collection::vec(0usize..3000, 1..40),
        seed in any::<u8>(),
    ) -> Vec<Vec<u8>> {
        sizes
            .into_iter()
            .enumerate()
            .map(|(i, len)| vec![seed.wrapping_add(i as u8); len])
            .collect()
    }
}

proptest! {
    #[test]
    fn appended_bytes_survive_growth(
        role in any_role(),
        initial in 1u64..4096,
        appends in append_sequence(),
    ) {
        let (_, ctx) = context();
        let mut buffer = GrowableBuffer::new(&ctx, role, "prop", initial).unwrap();
        let mut expected: Vec<(u64, Vec<u8>)> = Vec::new();

        for chunk in &appends {
            let offset = buffer.append(chunk).unwrap();
            prop_assert_eq!(offset % role.alignment(), 0);
            if let Some((last_offset, last)) = expected.last() {
                prop_assert!(offset >= last_offset + last.len() as u64);
            }
            expected.push((offset, chunk.clone()));
            prop_assert!(buffer.len() <= buffer.capacity());
        }

        let bytes = buffer.bytes().unwrap();
        for (offset, chunk) in &expected {
            let start = *offset as usize;
            prop_assert_eq!(&bytes[start..start + chunk.len()], chunk.as_slice());
        }
    }

    #[test]
    fn growth_capacity_fits_request(
        old in 4u64..(256 * MIB),
        extra in 1u64..(64 * MIB),
        alignment in prop_oneof![Just(4u64), Just(256u64)],
    ) {
        let needed = old + extra;
        let grown = growth_capacity(old, needed, alignment);
        prop_assert!(grown >= needed);
        prop_assert_eq!(grown % alignment, 0);
        prop_assert!(grown <= GROWTH_CEILING.max(align_up(needed, alignment)));
    }

    #[test]
    fn growth_count_matches_capacity_changes(
        appends in append_sequence(),
    ) {
        let (_, ctx) = context();
        let mut buffer = GrowableBuffer::new(&ctx, BufferRole::Vertex, "prop", 256).unwrap();
        let mut changes = 0;
        for chunk in &appends {
            let before = buffer.capacity();
            buffer.append(chunk).unwrap();
            if buffer.capacity() != before {
                changes += 1;
            }
        }
        prop_assert_eq!(buffer.grow_count(), changes);
    }
}
