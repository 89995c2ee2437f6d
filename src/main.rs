use std::sync::Arc;

use stratum::buffer::BufferPoolManager;
use stratum::index::{BPlusTree, IntegerComparator};
use stratum::storage::disk::DiskManager;
use stratum::{PageId, RecordId, SlotId};

fn main() {
    tracing_subscriber::fmt::init();

    println!("Stratum - storage core of a disk-oriented RDBMS");
    println!("===============================================\n");

    let db_path = "demo.db";

    let disk_manager = Arc::new(DiskManager::new(db_path).expect("Failed to create disk manager"));
    println!("Created disk manager for: {}", db_path);

    let bpm = Arc::new(BufferPoolManager::new(16, 2, disk_manager, None));
    println!("Created buffer pool with 16 frames (LRU-2)\n");

    // Page 0 backs the tree's header
    let header_page_id = bpm.new_page().expect("Failed to allocate header page");
    bpm.unpin_page(header_page_id, false);

    let tree = BPlusTree::new(
        "demo_index",
        header_page_id,
        Arc::clone(&bpm),
        IntegerComparator,
        4,
        4,
    )
    .expect("Failed to create index");

    // Insert out of order so the splits are visible in the rendering
    let keys = [8u32, 3, 11, 1, 6, 14, 4, 9, 2, 12, 7, 13, 5, 10];
    for &key in &keys {
        let rid = RecordId::new(PageId::new(100 + key), SlotId::new(0));
        tree.insert(key, rid).expect("insert failed");
    }
    println!("Inserted {} keys", keys.len());

    println!("\nTree structure:");
    println!("{}", tree.pretty_print().expect("pretty print failed"));

    print!("In-order scan: ");
    let mut iter = tree.begin().expect("begin failed");
    while let Some((key, _rid)) = iter.next_entry().expect("scan failed") {
        print!("{} ", key);
    }
    println!();

    tree.remove(1).expect("remove failed");
    tree.remove(2).expect("remove failed");
    tree.remove(3).expect("remove failed");
    println!("\nAfter removing 1, 2, 3:");
    println!("{}", tree.pretty_print().expect("pretty print failed"));

    let mut found = Vec::new();
    if tree.get_value(9, &mut found).expect("lookup failed") {
        println!("Lookup 9 -> {}", found[0]);
    }

    bpm.flush_all_pages().expect("flush failed");
    println!("Flushed all pages to disk");

    std::fs::remove_file(db_path).ok();
    println!("\nDemo completed successfully!");
}
