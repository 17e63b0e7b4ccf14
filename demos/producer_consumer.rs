//! Producer/Consumer across real processes
//!
//! The parent creates the queue and re-executes itself as several producer
//! processes. Each producer opens the queue by name and pushes synthetic
//! image/label pairs; the parent drains them and checks every item.
//!
//! ```bash
//! RUST_LOG=debug cargo run --release --example producer_consumer -- 4 500
//! ```

use slotq::{Array, DataQueue, ElementType, QueueConfig, Template, Wait};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

const IMAGE_SHAPE: [usize; 3] = [300, 300, 3];
const LABEL_SHAPE: [usize; 2] = [8732, 25];

fn image_template() -> Template {
    Template::new(ElementType::F32, IMAGE_SHAPE.to_vec())
}

fn label_template() -> Template {
    Template::new(ElementType::F32, LABEL_SHAPE.to_vec())
}

fn sample(producer: u32, seq: u32) -> (Array, Array, Vec<u8>) {
    let value = (producer * 1000 + seq) as f32;
    let image_len = IMAGE_SHAPE.iter().product::<usize>();
    let label_len = LABEL_SHAPE.iter().product::<usize>();
    let image = Array::from_elements(IMAGE_SHAPE.to_vec(), &vec![value; image_len][..]);
    let label = Array::from_elements(LABEL_SHAPE.to_vec(), &vec![-value; label_len][..]);
    let mut meta = producer.to_le_bytes().to_vec();
    meta.extend_from_slice(&seq.to_le_bytes());
    (image, label, meta)
}

fn run_producer(name: &str, producer: u32, count: u32) -> slotq::Result<()> {
    let queue = DataQueue::open(name)?;
    for seq in 0..count {
        let (image, label, meta) = sample(producer, seq);
        queue.put(&image, &label, &meta, Wait::Forever)?;
    }
    log::info!("[Producer {}] sent {} items", producer, count);
    Ok(())
}

fn run_consumer(producers: u32, count: u32) -> Result<(), Box<dyn std::error::Error>> {
    let name = format!("demo_{}", std::process::id());
    let queue = DataQueue::create(
        &name,
        image_template(),
        label_template(),
        QueueConfig::with_capacity(16),
    )?;
    println!("[Consumer] queue '{}' with {} slots", name, queue.capacity());

    let exe = std::env::current_exe()?;
    let children: Vec<Child> = (0..producers)
        .map(|p| {
            Command::new(&exe)
                .args(["producer", &name, &p.to_string(), &count.to_string()])
                .spawn()
        })
        .collect::<Result<_, _>>()?;

    let total = producers * count;
    let mut next_seq = vec![0u32; producers as usize];
    let start = Instant::now();

    for _ in 0..total {
        let item = queue.get(Wait::Timeout(Duration::from_secs(30)))?;
        let producer = u32::from_le_bytes(item.metadata[..4].try_into()?);
        let seq = u32::from_le_bytes(item.metadata[4..8].try_into()?);

        // Items from one producer arrive in the order it sent them
        assert_eq!(seq, next_seq[producer as usize], "producer {producer} out of order");
        next_seq[producer as usize] += 1;

        let (image, label, _) = sample(producer, seq);
        assert_eq!(item.image, image);
        assert_eq!(item.label, label);
    }

    let elapsed = start.elapsed();
    for mut child in children {
        let status = child.wait()?;
        if !status.success() {
            return Err(format!("producer exited with {status}").into());
        }
    }

    let bytes = total as f64 * (image_template().byte_len() + label_template().byte_len()) as f64;
    println!(
        "[Consumer] {} items in {:.2?} ({:.1} items/s, {:.1} MB/s)",
        total,
        elapsed,
        total as f64 / elapsed.as_secs_f64(),
        bytes / elapsed.as_secs_f64() / 1e6
    );
    assert!(queue.is_empty());
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("producer") {
        let name = args.get(2).ok_or("missing queue name")?;
        let producer: u32 = args.get(3).ok_or("missing producer id")?.parse()?;
        let count: u32 = args.get(4).ok_or("missing item count")?.parse()?;
        run_producer(name, producer, count)?;
        return Ok(());
    }

    let producers: u32 = args.get(1).map(|s| s.parse()).transpose()?.unwrap_or(4);
    let count: u32 = args.get(2).map(|s| s.parse()).transpose()?.unwrap_or(200);
    run_consumer(producers, count)
}
