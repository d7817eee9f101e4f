use mapalloc::Allocator;

fn log_alloc(addr: *mut u8, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() {
    // RUST_LOG=trace shows the region grants and reclamations.
    env_logger::init();

    let mut allocator = Allocator::new();

    let addr1 = allocator.allocate(8).unwrap().as_ptr();
    log_alloc(addr1, 8);

    let addr2 = allocator.allocate(100).unwrap().as_ptr();
    log_alloc(addr2, 100);

    let addr3 = allocator.zero_allocate(16, 4).unwrap().as_ptr();
    log_alloc(addr3, 16 * 4);

    unsafe {
        allocator.release(addr1).unwrap();
        allocator.release(addr2).unwrap();
        allocator.release(addr3).unwrap();
    }

    println!("Directory empty again: {}", allocator.is_empty());
}
