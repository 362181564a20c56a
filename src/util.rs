use alloc::{alloc::Layout, boxed::Box, string::String, sync::Arc};

use crate::error::{EResult, Errno};

/// Fallibly allocate a [`Box`], reporting `ENOMEM` instead of aborting.
pub fn try_box<T>(value: T) -> EResult<Box<T>> {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Ok(Box::new(value));
    }
    let ptr = unsafe { alloc::alloc::alloc(layout) } as *mut T;
    if ptr.is_null() {
        return Err(Errno::ENOMEM);
    }
    unsafe {
        ptr.write(value);
        Ok(Box::from_raw(ptr))
    }
}

/// Fallibly allocate an [`Arc`], reporting `ENOMEM` instead of aborting.
/// The control block is small; the payload dominates, so the box round-trip
/// is an acceptable approximation of a fallible `Arc` allocation.
pub fn try_arc<T>(value: T) -> EResult<Arc<T>> {
    Ok(Arc::from(try_box(value)?))
}

/// Try to parse a null-terminated UTF-16-LE string.
pub fn parse_utf16_le(raw: &[u8]) -> EResult<String> {
    let mut buf = String::new();

    let mut iter = raw.iter();
    while let Some(low) = iter.next()
        && let Some(high) = iter.next()
    {
        let ord = ((*high as u16) << 8) | (*low as u16);
        if ord == 0 {
            break;
        }
        buf.try_reserve(1)?;
        buf.push(char::from_u32(ord as u32).unwrap_or(char::REPLACEMENT_CHARACTER));
    }

    Ok(buf)
}
