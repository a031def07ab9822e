#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use prometheus_client::registry::Registry;
use shoal_storage::pages::{Config, PageId, PagePool, Purpose};
use shoal_utils::{NZUsize, NZU64};

const PAGE_SIZE: usize = 64;
const MAX_OPERATIONS: usize = 256;

#[derive(Arbitrary, Debug)]
enum Operation {
    Get { purpose: u8 },
    Put { index: u8 },
    Write { index: u8, offset: u8, byte: u8 },
    Read { index: u8 },
}

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    pages: u8,
    operations: Vec<Operation>,
}

fn fuzz(input: FuzzInput) {
    let pages = input.pages.max(1) as u64;
    let pool = PagePool::init(
        Config {
            name: "fuzz".into(),
            directory: None,
            page_size: NZUsize!(PAGE_SIZE),
            capacity_bytes: NZU64!(PAGE_SIZE as u64 * pages),
        },
        &mut Registry::default(),
    )
    .expect("valid config");

    // Held pages with the byte last written at each offset
    let mut held: Vec<(PageId, [u8; PAGE_SIZE])> = Vec::new();
    for op in input.operations.into_iter().take(MAX_OPERATIONS) {
        match op {
            Operation::Get { purpose } => {
                let purpose = Purpose::ALL[purpose as usize % Purpose::COUNT];
                match pool.get(purpose) {
                    Some(id) => {
                        assert!(held.iter().all(|(other, _)| other.number != id.number));
                        let mut contents = [0u8; PAGE_SIZE];
                        pool.read(id, 0, &mut contents);
                        held.push((id, contents));
                    }
                    None => assert_eq!(held.len() as u64, pages),
                }
            }
            Operation::Put { index } => {
                if held.is_empty() {
                    continue;
                }
                let (id, _) = held.swap_remove(index as usize % held.len());
                pool.put(id);
                assert!(!pool.is_current(&id));
            }
            Operation::Write {
                index,
                offset,
                byte,
            } => {
                if held.is_empty() {
                    continue;
                }
                let len = held.len();
                let (id, contents) = &mut held[index as usize % len];
                let offset = offset as usize % PAGE_SIZE;
                pool.write(*id, offset, &[byte]);
                contents[offset] = byte;
            }
            Operation::Read { index } => {
                if held.is_empty() {
                    continue;
                }
                let (id, contents) = &held[index as usize % held.len()];
                let mut buf = [0u8; PAGE_SIZE];
                pool.read(*id, 0, &mut buf);
                assert_eq!(&buf, contents);
            }
        }
        assert_eq!(pool.level() as usize, held.len());
    }
}

fuzz_target!(|input: FuzzInput| {
    fuzz(input);
});
