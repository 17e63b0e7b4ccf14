//! Cross-process exchange queue for fixed-shape array pairs
//!
//! One shared memory object holds everything:
//!
//! ```text
//! +--------------+------------------+---------------+-------------+-------------+
//! | QueueHeader  | free-slot ring   | order ring    | image arena | label arena |
//! |              | (slot ids)       | (id + meta)   | cap x image | cap x label |
//! +--------------+------------------+---------------+-------------+-------------+
//! ```
//!
//! Slot ids move between the two rings; whoever holds an id outside the rings
//! has exclusive access to that slot's arena entries. There are no locks on
//! the arenas themselves.

use crate::error::{Mismatch, Payload, Result, SlotqError};
use crate::ring::{IndexRing, RingHeader, CACHE_LINE_SIZE};
use crate::shm::SharedRegion;
use crate::template::{Array, ArrayView, ElementType, Template};
use crate::wait::{Deadline, Wait};
use std::sync::atomic::{AtomicU32, Ordering};

/// Magic number for queue validation
const QUEUE_MAGIC: u32 = 0x534C_5451; // "SLTQ"
const LAYOUT_VERSION: u32 = 1;

/// Maximum number of dimensions per template
pub const MAX_DIMS: usize = 8;

/// Upper bound for `QueueConfig::max_metadata_len`
pub const MAX_METADATA_LEN: usize = 1 << 20;

/// Default number of slots
const DEFAULT_CAPACITY: usize = 32;

/// Default metadata bytes per item
const DEFAULT_METADATA_LEN: usize = 4096;

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of slots, i.e. items that can be in flight at once
    pub capacity: usize,
    /// Maximum metadata bytes per item
    pub max_metadata_len: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_metadata_len: DEFAULT_METADATA_LEN,
        }
    }
}

impl QueueConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }
}

/// Template as stored in the queue header
#[repr(C)]
#[derive(Clone, Copy)]
struct TemplateRecord {
    dtype: u32,
    ndim: u32,
    dims: [u64; MAX_DIMS],
}

impl TemplateRecord {
    fn new(template: &Template) -> Self {
        let mut dims = [0u64; MAX_DIMS];
        for (dst, &dim) in dims.iter_mut().zip(template.shape()) {
            *dst = dim as u64;
        }
        Self {
            dtype: template.dtype().code(),
            ndim: template.shape().len() as u32,
            dims,
        }
    }

    fn template(&self) -> Result<Template> {
        let dtype = ElementType::from_code(self.dtype).ok_or_else(|| {
            SlotqError::IncompatibleLayout(format!("unknown element type code {}", self.dtype))
        })?;
        let ndim = self.ndim as usize;
        if ndim > MAX_DIMS {
            return Err(SlotqError::IncompatibleLayout(format!(
                "template has {} dimensions",
                ndim
            )));
        }
        let shape = self.dims[..ndim].iter().map(|&d| d as usize).collect::<Vec<_>>();
        Ok(Template::new(dtype, shape))
    }
}

/// Queue header stored at the beginning of shared memory
#[repr(C)]
struct QueueHeader {
    /// Written last by the creator; openers refuse anything else
    magic: AtomicU32,
    version: u32,
    capacity: u64,
    max_metadata_len: u64,
    total_size: u64,
    image: TemplateRecord,
    label: TemplateRecord,
    // Offsets to regions
    registry_offset: u64,
    order_offset: u64,
    image_offset: u64,
    label_offset: u64,
}

/// Byte offsets of every region, derived from templates and config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    registry_offset: usize,
    order_offset: usize,
    image_offset: usize,
    image_stride: usize,
    label_offset: usize,
    label_stride: usize,
    total_size: usize,
}

impl Layout {
    fn compute(image: &Template, label: &Template, config: &QueueConfig) -> Result<Self> {
        let overflow = || SlotqError::Configuration("queue does not fit in memory".to_string());
        let align = |size: usize| -> Result<usize> {
            size.checked_add(CACHE_LINE_SIZE - 1)
                .map(|s| s & !(CACHE_LINE_SIZE - 1))
                .ok_or_else(overflow)
        };

        let capacity = config.capacity;
        let image_len = image.checked_byte_len().ok_or_else(overflow)?;
        let label_len = label.checked_byte_len().ok_or_else(overflow)?;
        let image_stride = align(image_len)?;
        let label_stride = align(label_len)?;

        let registry_offset = align(std::mem::size_of::<QueueHeader>())?;
        let order_offset = registry_offset + align(RingHeader::size_for(capacity, 0))?;
        let image_offset = order_offset
            .checked_add(align(RingHeader::size_for(capacity, config.max_metadata_len))?)
            .ok_or_else(overflow)?;
        let label_offset = image_stride
            .checked_mul(capacity)
            .and_then(|arena| image_offset.checked_add(arena))
            .ok_or_else(overflow)?;
        let total_size = label_stride
            .checked_mul(capacity)
            .and_then(|arena| label_offset.checked_add(arena))
            .ok_or_else(overflow)?;

        Ok(Self {
            registry_offset,
            order_offset,
            image_offset,
            image_stride,
            label_offset,
            label_stride,
            total_size,
        })
    }
}

fn validate_template(kind: &str, template: &Template) -> Result<()> {
    if template.shape().len() > MAX_DIMS {
        return Err(SlotqError::Configuration(format!(
            "{} template has {} dimensions, at most {} are supported",
            kind,
            template.shape().len(),
            MAX_DIMS
        )));
    }
    match template.checked_byte_len() {
        Some(0) => Err(SlotqError::Configuration(format!(
            "{} template {:?} has zero size",
            kind,
            template.shape()
        ))),
        Some(_) => Ok(()),
        None => Err(SlotqError::Configuration(format!(
            "{} template {:?} is too large",
            kind,
            template.shape()
        ))),
    }
}

fn validate_config(config: &QueueConfig) -> Result<()> {
    if config.capacity == 0 {
        return Err(SlotqError::Configuration(
            "capacity must be greater than zero".to_string(),
        ));
    }
    if config.capacity > u32::MAX as usize {
        return Err(SlotqError::Configuration(format!(
            "capacity {} exceeds {}",
            config.capacity,
            u32::MAX
        )));
    }
    if config.max_metadata_len > MAX_METADATA_LEN {
        return Err(SlotqError::Configuration(format!(
            "max_metadata_len {} exceeds {}",
            config.max_metadata_len, MAX_METADATA_LEN
        )));
    }
    Ok(())
}

/// One payload kind's buffers, `stride` bytes apart, indexed by slot id
struct SlotArena {
    base: *mut u8,
    stride: usize,
    len: usize,
}

// SAFETY: a slot's bytes are only touched by the process holding its id
unsafe impl Send for SlotArena {}
unsafe impl Sync for SlotArena {}

impl SlotArena {
    /// # Safety
    /// Caller must hold `slot` and `bytes.len()` must equal the template's
    /// byte length.
    #[inline]
    unsafe fn write(&self, slot: u32, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.len);
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            self.base.add(slot as usize * self.stride),
            self.len,
        );
    }

    /// # Safety
    /// Caller must hold `slot` and `out.len()` must equal the template's
    /// byte length.
    #[inline]
    unsafe fn read(&self, slot: u32, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.len);
        std::ptr::copy_nonoverlapping(
            self.base.add(slot as usize * self.stride),
            out.as_mut_ptr(),
            self.len,
        );
    }
}

/// An item taken off the queue; owns its data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub image: Array,
    pub label: Array,
    pub metadata: Vec<u8>,
}

impl Item {
    pub fn into_parts(self) -> (Array, Array, Vec<u8>) {
        (self.image, self.label, self.metadata)
    }
}

/// Bounded queue of (image, label, metadata) items shared between processes
pub struct DataQueue {
    shm: SharedRegion,
    image: Template,
    label: Template,
    capacity: usize,
    max_metadata_len: usize,
    registry: IndexRing,
    order: IndexRing,
    image_arena: SlotArena,
    label_arena: SlotArena,
}

impl DataQueue {
    /// Create a new queue as the owner.
    ///
    /// Every slot starts out free. The shared memory name is unlinked when
    /// the owner is dropped. Fails with [`SlotqError::AlreadyExists`] if a
    /// queue already lives under `name`; it is left untouched.
    pub fn create(
        name: &str,
        image: Template,
        label: Template,
        config: QueueConfig,
    ) -> Result<Self> {
        validate_config(&config)?;
        validate_template("image", &image)?;
        validate_template("label", &label)?;
        let layout = Layout::compute(&image, &label, &config)?;

        let shm = SharedRegion::create(name, layout.total_size)?;
        let base = shm.as_ptr();
        let header = base as *mut QueueHeader;

        unsafe {
            (*header).version = LAYOUT_VERSION;
            (*header).capacity = config.capacity as u64;
            (*header).max_metadata_len = config.max_metadata_len as u64;
            (*header).total_size = layout.total_size as u64;
            (*header).image = TemplateRecord::new(&image);
            (*header).label = TemplateRecord::new(&label);
            (*header).registry_offset = layout.registry_offset as u64;
            (*header).order_offset = layout.order_offset as u64;
            (*header).image_offset = layout.image_offset as u64;
            (*header).label_offset = layout.label_offset as u64;

            RingHeader::init(
                base.add(layout.registry_offset) as *mut RingHeader,
                config.capacity,
                0,
            );
            RingHeader::init(
                base.add(layout.order_offset) as *mut RingHeader,
                config.capacity,
                config.max_metadata_len,
            );
        }

        let queue = unsafe { Self::from_layout(shm, image, label, &config, &layout) };

        for slot in 0..config.capacity as u32 {
            if !queue.registry.try_push(slot, &[]) {
                return Err(SlotqError::Configuration(format!(
                    "free-slot registry rejected slot {}",
                    slot
                )));
            }
        }

        // Publish: openers may attach from here on
        let published = unsafe { &*header };
        published.magic.store(QUEUE_MAGIC, Ordering::Release);

        log::debug!(
            "created queue '{}': {} slots, image {} bytes, label {} bytes, {} bytes total",
            name,
            config.capacity,
            queue.image.byte_len(),
            queue.label.byte_len(),
            layout.total_size
        );

        Ok(queue)
    }

    /// Attach to a queue created by another process (or thread).
    ///
    /// Templates and capacity are read from shared memory.
    pub fn open(name: &str) -> Result<Self> {
        let shm = SharedRegion::open(name)?;
        if shm.size() < std::mem::size_of::<QueueHeader>() {
            return Err(SlotqError::IncompatibleLayout(format!(
                "region is {} bytes, smaller than the queue header",
                shm.size()
            )));
        }

        let header = unsafe { &*(shm.as_ptr() as *const QueueHeader) };

        let magic = header.magic.load(Ordering::Acquire);
        if magic != QUEUE_MAGIC {
            return Err(SlotqError::InvalidMagic {
                expected: QUEUE_MAGIC,
                got: magic,
            });
        }
        if header.version != LAYOUT_VERSION {
            return Err(SlotqError::IncompatibleLayout(format!(
                "layout version {}, expected {}",
                header.version, LAYOUT_VERSION
            )));
        }

        let image = header.image.template()?;
        let label = header.label.template()?;
        let config = QueueConfig {
            capacity: header.capacity as usize,
            max_metadata_len: header.max_metadata_len as usize,
        };
        validate_config(&config).map_err(|e| SlotqError::IncompatibleLayout(e.to_string()))?;
        validate_template("image", &image)
            .and_then(|_| validate_template("label", &label))
            .map_err(|e| SlotqError::IncompatibleLayout(e.to_string()))?;

        // Everything the header claims must agree with what we would lay out
        let layout = Layout::compute(&image, &label, &config)?;
        let recorded = (
            header.registry_offset,
            header.order_offset,
            header.image_offset,
            header.label_offset,
            header.total_size,
        );
        let expected = (
            layout.registry_offset as u64,
            layout.order_offset as u64,
            layout.image_offset as u64,
            layout.label_offset as u64,
            layout.total_size as u64,
        );
        if recorded != expected || shm.size() < layout.total_size {
            return Err(SlotqError::IncompatibleLayout(format!(
                "header offsets {:?} do not match layout {:?} (region {} bytes)",
                recorded,
                expected,
                shm.size()
            )));
        }

        log::debug!(
            "opened queue '{}': {} slots, image {:?} {}, label {:?} {}",
            name,
            config.capacity,
            image.shape(),
            image.dtype(),
            label.shape(),
            label.dtype()
        );

        Ok(unsafe { Self::from_layout(shm, image, label, &config, &layout) })
    }

    /// # Safety
    /// `shm` must hold initialized rings at the offsets in `layout`.
    unsafe fn from_layout(
        shm: SharedRegion,
        image: Template,
        label: Template,
        config: &QueueConfig,
        layout: &Layout,
    ) -> Self {
        let base = shm.as_ptr();
        let registry = IndexRing::from_raw(base.add(layout.registry_offset) as *const RingHeader);
        let order = IndexRing::from_raw(base.add(layout.order_offset) as *const RingHeader);
        let image_arena = SlotArena {
            base: base.add(layout.image_offset),
            stride: layout.image_stride,
            len: image.byte_len(),
        };
        let label_arena = SlotArena {
            base: base.add(layout.label_offset),
            stride: layout.label_stride,
            len: label.byte_len(),
        };

        Self {
            shm,
            image,
            label,
            capacity: config.capacity,
            max_metadata_len: config.max_metadata_len,
            registry,
            order,
            image_arena,
            label_arena,
        }
    }

    /// Copy an item into a free slot and publish it.
    ///
    /// Fails with [`SlotqError::Validation`] before touching any slot if a
    /// payload does not match its template, and with [`SlotqError::Full`] if
    /// no slot frees up within `wait`.
    pub fn put<'a>(
        &self,
        image: impl Into<ArrayView<'a>>,
        label: impl Into<ArrayView<'a>>,
        metadata: &[u8],
        wait: Wait,
    ) -> Result<()> {
        let image = image.into();
        let label = label.into();

        self.image.check(Payload::Image, &image)?;
        self.label.check(Payload::Label, &label)?;
        if metadata.len() > self.max_metadata_len {
            return Err(SlotqError::validation(
                Payload::Metadata,
                Mismatch::TooLong {
                    max: self.max_metadata_len,
                    got: metadata.len(),
                },
            ));
        }

        let deadline = wait.deadline();

        // No free slot means the queue is full, not that the registry is empty
        let slot = match self.acquire_slot(deadline)? {
            Some(slot) => slot,
            None => return Err(SlotqError::Full),
        };

        unsafe {
            self.image_arena.write(slot, image.as_bytes());
            self.label_arena.write(slot, label.as_bytes());
        }

        // At most `capacity` slots are ever out of the registry, so the order
        // ring always has a cell for this one. Reaching this branch means the
        // shared region was corrupted.
        if !self.order.push(slot, metadata, deadline) {
            log::warn!(
                "queue '{}': order queue rejected slot {}, returning it to the free list",
                self.shm.name(),
                slot
            );
            self.release_slot(slot);
            return Err(SlotqError::Full);
        }

        log::trace!("queue '{}': published slot {}", self.shm.name(), slot);
        Ok(())
    }

    /// Take the oldest item off the queue.
    ///
    /// The returned arrays are copies; the slot is recycled only after the
    /// copy completes, so later puts never alter a returned item.
    pub fn get(&self, wait: Wait) -> Result<Item> {
        let mut metadata = vec![0u8; self.max_metadata_len];
        let (slot, len) = match self.order.pop(&mut metadata, wait.deadline()) {
            Some(entry) => entry,
            None => return Err(SlotqError::Empty),
        };
        self.check_slot(slot)?;
        metadata.truncate(len.min(self.max_metadata_len));

        let mut image = Array::zeros(&self.image);
        let mut label = Array::zeros(&self.label);
        unsafe {
            self.image_arena.read(slot, image.as_bytes_mut());
            self.label_arena.read(slot, label.as_bytes_mut());
        }

        // Copy-out is complete; the slot may be overwritten from here on
        self.release_slot(slot);

        log::trace!("queue '{}': consumed slot {}", self.shm.name(), slot);
        Ok(Item {
            image,
            label,
            metadata,
        })
    }

    fn acquire_slot(&self, deadline: Deadline) -> Result<Option<u32>> {
        let mut none = [0u8; 0];
        match self.registry.pop(&mut none, deadline) {
            Some((slot, _)) => {
                self.check_slot(slot)?;
                Ok(Some(slot))
            }
            None => Ok(None),
        }
    }

    fn release_slot(&self, slot: u32) {
        // The registry has a cell for every slot, so this cannot fail unless
        // an id was released twice
        if !self.registry.try_push(slot, &[]) {
            log::error!(
                "queue '{}': free-slot registry rejected slot {}",
                self.shm.name(),
                slot
            );
        }
    }

    fn check_slot(&self, slot: u32) -> Result<()> {
        if slot as usize >= self.capacity {
            return Err(SlotqError::IncompatibleLayout(format!(
                "slot id {} out of range for capacity {}",
                slot, self.capacity
            )));
        }
        Ok(())
    }

    /// `true` if no published item is waiting. Snapshot only.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Items published and not yet taken. Snapshot only.
    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Slots currently in the free registry. Snapshot only.
    #[inline]
    pub fn free_slots(&self) -> usize {
        self.registry.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn max_metadata_len(&self) -> usize {
        self.max_metadata_len
    }

    #[inline]
    pub fn image_template(&self) -> &Template {
        &self.image
    }

    #[inline]
    pub fn label_template(&self) -> &Template {
        &self.label
    }

    /// Get the shared memory name of the queue
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Check if this handle created (and will unlink) the queue
    pub fn is_owner(&self) -> bool {
        self.shm.is_owner()
    }

    /// Remove the name of a queue whose owner died without dropping it, so
    /// the name can be created again. Handles still attached keep working.
    pub fn unlink(name: &str) -> Result<()> {
        log::debug!("unlinking queue '{}'", name);
        SharedRegion::unlink(name)
    }
}
