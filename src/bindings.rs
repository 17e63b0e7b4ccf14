//! C Bindings for slotq
//!
//! Provides a raw C API so producers or consumers written in other languages
//! can share a queue with Rust processes. Payloads cross the boundary as raw
//! bytes; their element type and shape are the queue's templates.

use crate::error::SlotqError;
use crate::queue::{DataQueue, QueueConfig};
use crate::template::{ArrayView, ElementType, Template};
use crate::wait::Wait;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::slice;
use std::time::Duration;

pub const SLOTQ_OK: c_int = 0;
pub const SLOTQ_ERR_VALIDATION: c_int = -1;
pub const SLOTQ_ERR_FULL: c_int = -2;
pub const SLOTQ_ERR_EMPTY: c_int = -3;
pub const SLOTQ_ERR_CONFIG: c_int = -4;
pub const SLOTQ_ERR_ARG: c_int = -5;
pub const SLOTQ_ERR_SHM: c_int = -6;

// Opaque handle
pub struct SlotqHandle(DataQueue);

#[repr(C)]
pub struct SlotqConfig {
    pub capacity: usize,
    pub max_metadata_len: usize,
}

/// Element type code (1 = u8 ... 10 = f64, see `ElementType`) and shape
#[repr(C)]
pub struct SlotqTemplate {
    pub dtype: u32,
    pub ndim: usize,
    pub shape: *const usize,
}

fn status(err: &SlotqError) -> c_int {
    match err {
        SlotqError::Validation { .. } => SLOTQ_ERR_VALIDATION,
        SlotqError::Full => SLOTQ_ERR_FULL,
        SlotqError::Empty => SLOTQ_ERR_EMPTY,
        SlotqError::Configuration(_) => SLOTQ_ERR_CONFIG,
        _ => SLOTQ_ERR_SHM,
    }
}

/// `timeout_secs < 0` (or NaN) means no timeout
fn wait_policy(block: bool, timeout_secs: f64) -> Wait {
    let timeout = if timeout_secs >= 0.0 {
        Duration::try_from_secs_f64(timeout_secs).ok()
    } else {
        None
    };
    Wait::from_flags(block, timeout)
}

unsafe fn name_arg<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    CStr::from_ptr(name).to_str().ok()
}

unsafe fn template_arg(template: *const SlotqTemplate) -> Option<Template> {
    let template = template.as_ref()?;
    let dtype = ElementType::from_code(template.dtype)?;
    let shape = if template.ndim == 0 {
        Vec::new()
    } else if template.shape.is_null() {
        return None;
    } else {
        slice::from_raw_parts(template.shape, template.ndim).to_vec()
    };
    Some(Template::new(dtype, shape))
}

unsafe fn bytes_arg<'a>(data: *const u8, len: usize) -> Option<&'a [u8]> {
    if len == 0 {
        Some(&[])
    } else if data.is_null() {
        None
    } else {
        Some(slice::from_raw_parts(data, len))
    }
}

/// Create a new queue (owner side)
///
/// Returns null on any failure.
///
/// # Safety
/// `name` must be a valid null-terminated string; templates must point to
/// valid `SlotqTemplate`s whose `shape` holds `ndim` entries
#[no_mangle]
pub unsafe extern "C" fn slotq_create(
    name: *const c_char,
    image: *const SlotqTemplate,
    label: *const SlotqTemplate,
    config: SlotqConfig,
) -> *mut SlotqHandle {
    let (Some(name), Some(image), Some(label)) = (name_arg(name), template_arg(image), template_arg(label))
    else {
        return ptr::null_mut();
    };

    let rust_config = QueueConfig {
        capacity: config.capacity,
        max_metadata_len: config.max_metadata_len,
    };

    match DataQueue::create(name, image, label, rust_config) {
        Ok(queue) => Box::into_raw(Box::new(SlotqHandle(queue))),
        Err(e) => {
            log::error!("slotq_create('{}') failed: {}", name, e);
            ptr::null_mut()
        }
    }
}

/// Attach to an existing queue
///
/// # Safety
/// `name` must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn slotq_open(name: *const c_char) -> *mut SlotqHandle {
    let Some(name) = name_arg(name) else {
        return ptr::null_mut();
    };

    match DataQueue::open(name) {
        Ok(queue) => Box::into_raw(Box::new(SlotqHandle(queue))),
        Err(e) => {
            log::error!("slotq_open('{}') failed: {}", name, e);
            ptr::null_mut()
        }
    }
}

/// Destroy a handle
///
/// # Safety
/// `handle` must come from `slotq_create`/`slotq_open` and not be used again
#[no_mangle]
pub unsafe extern "C" fn slotq_destroy(handle: *mut SlotqHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Put one item. Image and label must be exactly their template's byte length.
///
/// # Safety
/// `handle` must be live; each data pointer must be valid for its length
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn slotq_put(
    handle: *const SlotqHandle,
    image: *const u8,
    image_len: usize,
    label: *const u8,
    label_len: usize,
    metadata: *const u8,
    metadata_len: usize,
    block: bool,
    timeout_secs: f64,
) -> c_int {
    let Some(SlotqHandle(queue)) = handle.as_ref() else {
        return SLOTQ_ERR_ARG;
    };
    let (Some(image), Some(label), Some(metadata)) = (
        bytes_arg(image, image_len),
        bytes_arg(label, label_len),
        bytes_arg(metadata, metadata_len),
    ) else {
        return SLOTQ_ERR_ARG;
    };

    let image_t = queue.image_template();
    let label_t = queue.label_template();
    let image = ArrayView::new(image_t.dtype(), image_t.shape(), image);
    let label = ArrayView::new(label_t.dtype(), label_t.shape(), label);

    match queue.put(image, label, metadata, wait_policy(block, timeout_secs)) {
        Ok(()) => SLOTQ_OK,
        Err(e) => status(&e),
    }
}

/// Get the oldest item.
///
/// Image and label buffers must hold at least their template's byte length.
/// Metadata is truncated to `metadata_cap`; its full length is written to
/// `out_metadata_len`.
///
/// # Safety
/// `handle` must be live; each buffer must be valid for its capacity
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn slotq_get(
    handle: *const SlotqHandle,
    image_out: *mut u8,
    image_cap: usize,
    label_out: *mut u8,
    label_cap: usize,
    metadata_out: *mut u8,
    metadata_cap: usize,
    out_metadata_len: *mut usize,
    block: bool,
    timeout_secs: f64,
) -> c_int {
    let Some(SlotqHandle(queue)) = handle.as_ref() else {
        return SLOTQ_ERR_ARG;
    };

    // Checked before popping so a short buffer never loses an item
    let image_len = queue.image_template().byte_len();
    let label_len = queue.label_template().byte_len();
    if image_out.is_null()
        || label_out.is_null()
        || image_cap < image_len
        || label_cap < label_len
        || (metadata_cap > 0 && metadata_out.is_null())
    {
        return SLOTQ_ERR_ARG;
    }

    let item = match queue.get(wait_policy(block, timeout_secs)) {
        Ok(item) => item,
        Err(e) => return status(&e),
    };

    ptr::copy_nonoverlapping(item.image.as_bytes().as_ptr(), image_out, image_len);
    ptr::copy_nonoverlapping(item.label.as_bytes().as_ptr(), label_out, label_len);
    let copy_len = item.metadata.len().min(metadata_cap);
    if copy_len > 0 {
        ptr::copy_nonoverlapping(item.metadata.as_ptr(), metadata_out, copy_len);
    }
    if !out_metadata_len.is_null() {
        *out_metadata_len = item.metadata.len();
    }
    SLOTQ_OK
}

/// Returns 1 if no item is waiting, 0 otherwise, `SLOTQ_ERR_ARG` on null
///
/// # Safety
/// `handle` must be live or null
#[no_mangle]
pub unsafe extern "C" fn slotq_is_empty(handle: *const SlotqHandle) -> c_int {
    match handle.as_ref() {
        Some(SlotqHandle(queue)) => queue.is_empty() as c_int,
        None => SLOTQ_ERR_ARG,
    }
}

/// Number of slots, 0 on null
///
/// # Safety
/// `handle` must be live or null
#[no_mangle]
pub unsafe extern "C" fn slotq_capacity(handle: *const SlotqHandle) -> usize {
    handle.as_ref().map_or(0, |SlotqHandle(queue)| queue.capacity())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_c_round_trip() {
        let name = CString::new(format!("test_c_api_{}", std::process::id())).unwrap();
        let image_shape = [4usize, 4];
        let label_shape = [2usize];
        let image_t = SlotqTemplate {
            dtype: 1,
            ndim: 2,
            shape: image_shape.as_ptr(),
        };
        let label_t = SlotqTemplate {
            dtype: 9,
            ndim: 1,
            shape: label_shape.as_ptr(),
        };

        unsafe {
            let owner = slotq_create(
                name.as_ptr(),
                &image_t,
                &label_t,
                SlotqConfig {
                    capacity: 1,
                    max_metadata_len: 16,
                },
            );
            assert!(!owner.is_null());
            let peer = slotq_open(name.as_ptr());
            assert!(!peer.is_null());
            assert_eq!(slotq_capacity(peer), 1);
            assert_eq!(slotq_is_empty(peer), 1);

            let image = [9u8; 16];
            let label = [0u8; 8];
            let meta = b"hello";
            assert_eq!(
                slotq_put(peer, image.as_ptr(), 16, label.as_ptr(), 8, meta.as_ptr(), 5, false, -1.0),
                SLOTQ_OK
            );
            assert_eq!(
                slotq_put(peer, image.as_ptr(), 16, label.as_ptr(), 8, meta.as_ptr(), 5, false, -1.0),
                SLOTQ_ERR_FULL
            );
            assert_eq!(
                slotq_put(peer, image.as_ptr(), 15, label.as_ptr(), 8, ptr::null(), 0, false, -1.0),
                SLOTQ_ERR_VALIDATION
            );
            assert_eq!(slotq_is_empty(owner), 0);

            let mut image_out = [0u8; 16];
            let mut label_out = [1u8; 8];
            let mut meta_out = [0u8; 3];
            let mut meta_len = 0usize;
            assert_eq!(
                slotq_get(
                    owner,
                    image_out.as_mut_ptr(),
                    16,
                    label_out.as_mut_ptr(),
                    8,
                    meta_out.as_mut_ptr(),
                    3,
                    &mut meta_len,
                    true,
                    0.0,
                ),
                SLOTQ_OK
            );
            assert_eq!(image_out, image);
            assert_eq!(label_out, label);
            assert_eq!(&meta_out, b"hel");
            assert_eq!(meta_len, 5);

            assert_eq!(
                slotq_get(
                    owner,
                    image_out.as_mut_ptr(),
                    16,
                    label_out.as_mut_ptr(),
                    8,
                    ptr::null_mut(),
                    0,
                    ptr::null_mut(),
                    false,
                    -1.0,
                ),
                SLOTQ_ERR_EMPTY
            );

            slotq_destroy(peer);
            slotq_destroy(owner);
        }
    }

    #[test]
    fn test_null_arguments() {
        unsafe {
            assert!(slotq_open(ptr::null()).is_null());
            assert_eq!(slotq_is_empty(ptr::null()), SLOTQ_ERR_ARG);
            assert_eq!(slotq_capacity(ptr::null()), 0);
            assert_eq!(
                slotq_put(ptr::null(), ptr::null(), 0, ptr::null(), 0, ptr::null(), 0, false, -1.0),
                SLOTQ_ERR_ARG
            );
        }
    }

    #[test]
    fn test_wait_policy_from_c() {
        assert_eq!(wait_policy(false, 3.0), Wait::NonBlocking);
        assert_eq!(wait_policy(true, -1.0), Wait::Forever);
        assert_eq!(wait_policy(true, f64::NAN), Wait::Forever);
        assert_eq!(wait_policy(true, 0.0), Wait::NonBlocking);
        assert_eq!(
            wait_policy(true, 0.5),
            Wait::Timeout(Duration::from_millis(500))
        );
    }
}
