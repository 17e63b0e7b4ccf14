//! slotq - bounded cross-process exchange queue for fixed-shape array pairs
//!
//! Producer processes hand (image, label, metadata) items to consumer
//! processes through POSIX shared memory. The large arrays are copied into
//! preallocated slots instead of being serialized; only slot ids and small
//! metadata travel through the queue itself.
//!
//! # Architecture
//!
//! - **Buffer pool**: `capacity` image/label buffer pairs in one shared mapping
//! - **Free-slot registry**: ring of unused slot ids; running out means full
//! - **Order queue**: FIFO ring of (slot id, metadata) in publish order
//! - **[`DataQueue`]**: validates, acquires, copies, publishes, and back
//!
//! ```no_run
//! use slotq::{DataQueue, ElementType, QueueConfig, Template, Wait, Array};
//!
//! let image = Template::new(ElementType::F32, vec![300, 300, 3]);
//! let label = Template::new(ElementType::F32, vec![8732, 25]);
//! let queue = DataQueue::create("train", image.clone(), label.clone(), QueueConfig::default())?;
//!
//! queue.put(&Array::zeros(&image), &Array::zeros(&label), b"boxes", Wait::Forever)?;
//! let item = queue.get(Wait::Forever)?;
//! assert_eq!(item.metadata, b"boxes");
//! # Ok::<(), slotq::SlotqError>(())
//! ```

pub mod bindings;
pub mod error;
pub mod queue;
pub mod ring;
pub mod shm;
pub mod template;
pub mod wait;

pub use error::{Mismatch, Payload, Result, SlotqError};
pub use queue::{DataQueue, Item, QueueConfig, MAX_DIMS, MAX_METADATA_LEN};
pub use template::{Array, ArrayView, Element, ElementType, Template};
pub use wait::Wait;
