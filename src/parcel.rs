// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Growable serialization buffer with a parallel object-offset index
//! (`spec.md` §4.2), grounded in `original_source/binderlib/base/Parcel.c`.

use std::cell::Cell;
use std::fmt;

use crate::error::StatusCode;
use crate::object::{Binder, Descriptor, Handle};
use crate::process_state::ProcessState;
use crate::refbase::Shared;
use crate::stability::Stability;

const INTERFACE_TOKEN_MAGIC: i32 = 0x4234_6563;

/// Wire-level kind of an embedded object descriptor. `None` is a pragmatic
/// extension (not in the original's three-way union) used so a null
/// `Option<Shared<dyn Binder>>` round-trips through `write_strong_binder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
enum ObjectKind {
    NoneKind = 0,
    LocalBinder = 1,
    Handle = 2,
    Fd = 3,
}

impl ObjectKind {
    fn from_i32(v: i32) -> Option<ObjectKind> {
        match v {
            0 => Some(ObjectKind::NoneKind),
            1 => Some(ObjectKind::LocalBinder),
            2 => Some(ObjectKind::Handle),
            3 => Some(ObjectKind::Fd),
            _ => None,
        }
    }
}

/// Raw layout of an embedded object descriptor as written by
/// `write_strong_binder`/`write_file_descriptor`: `i32 kind, u64
/// handle_or_token, u64 cookie, i32 stability`. The kernel routing layer
/// (`driver::loopback`) needs to rewrite `LOCAL_BINDER` descriptors into
/// `HANDLE` descriptors in transit, without re-deriving this layout itself.
pub(crate) const OBJECT_DESCRIPTOR_LEN: usize = 20;
pub(crate) const LOCAL_BINDER_KIND: i32 = ObjectKind::LocalBinder as i32;
pub(crate) const HANDLE_KIND: i32 = ObjectKind::Handle as i32;

/// Reads `(kind, handle_or_token)` at a descriptor offset inside a raw data
/// buffer, without needing a `Parcel` wrapper around it.
pub(crate) fn object_kind_and_payload_at(data: &[u8], offset: usize) -> Option<(i32, u64)> {
    if offset + OBJECT_DESCRIPTOR_LEN > data.len() {
        return None;
    }
    let kind = i32::from_ne_bytes(data[offset..offset + 4].try_into().ok()?);
    let payload = u64::from_ne_bytes(data[offset + 4..offset + 12].try_into().ok()?);
    Some((kind, payload))
}

/// Overwrites the `(kind, handle_or_token)` fields of a descriptor in place;
/// cookie and stability are left untouched.
pub(crate) fn rewrite_object_kind_and_payload(data: &mut [u8], offset: usize, kind: i32, payload: u64) {
    data[offset..offset + 4].copy_from_slice(&kind.to_ne_bytes());
    data[offset + 4..offset + 12].copy_from_slice(&payload.to_ne_bytes());
}

/// A release callback installed when a parcel wraps a driver-owned mapped
/// buffer instead of an owned allocation (`spec.md` §4.2 "Ownership").
pub type ReleaseCallback = Box<dyn FnOnce(&[u8]) + Send>;

/// Binary-compatible serialization buffer, plus object-offset tracking.
pub struct Parcel {
    data: Vec<u8>,
    object_offsets: Vec<usize>,
    position: Cell<usize>,
    error: Cell<StatusCode>,
    sensitive: Cell<bool>,
    allow_fds: Cell<bool>,
    has_fds: Cell<bool>,
    release: Option<ReleaseCallback>,
}

fn pad_size(len: usize) -> usize {
    (len + 3) & !3
}

impl Parcel {
    pub fn new() -> Self {
        Parcel {
            data: Vec::with_capacity(256),
            object_offsets: Vec::new(),
            position: Cell::new(0),
            error: Cell::new(StatusCode::Ok),
            sensitive: Cell::new(false),
            allow_fds: Cell::new(true),
            has_fds: Cell::new(false),
            release: None,
        }
    }

    /// Wraps a driver-owned buffer; `release` fires exactly once, on drop,
    /// and is expected to issue `FREE_BUFFER`.
    pub fn from_driver_buffer(data: Vec<u8>, object_offsets: Vec<usize>, release: ReleaseCallback) -> Self {
        Parcel {
            data,
            object_offsets,
            position: Cell::new(0),
            error: Cell::new(StatusCode::Ok),
            sensitive: Cell::new(false),
            allow_fds: Cell::new(true),
            has_fds: Cell::new(false),
            release: Some(release),
        }
    }

    /// A private copy of `data` and `object_offsets`, cursor rewound;
    /// callers that hand a caller-owned parcel to dispatch code use this so
    /// the generated code's reads cannot disturb the caller's view
    /// (`spec.md` §4.5 "duplicates data into a local copy").
    pub fn duplicate(&self) -> Parcel {
        Parcel {
            data: self.data.clone(),
            object_offsets: self.object_offsets.clone(),
            position: Cell::new(0),
            error: Cell::new(StatusCode::Ok),
            sensitive: Cell::new(false),
            allow_fds: Cell::new(self.allow_fds.get()),
            has_fds: Cell::new(self.has_fds.get()),
            release: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data_position(&self) -> usize {
        self.position.get()
    }

    pub fn set_data_position(&self, pos: usize) {
        self.position.set(pos);
    }

    pub fn object_offsets(&self) -> &[usize] {
        &self.object_offsets
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn mark_sensitive(&self) {
        self.sensitive.set(true);
    }

    pub fn set_allow_fds(&self, allow: bool) {
        self.allow_fds.set(allow);
    }

    pub fn has_file_descriptors(&self) -> bool {
        self.has_fds.get()
    }

    pub fn error_check(&self) -> Result<(), StatusCode> {
        let e = self.error.get();
        if e.is_ok() {
            Ok(())
        } else {
            Err(e)
        }
    }

    fn latch(&self, status: Result<(), StatusCode>) -> Result<(), StatusCode> {
        if let Err(code) = status {
            if self.error.get().is_ok() {
                self.error.set(code);
            }
        }
        status
    }

    fn grow_for(&mut self, additional: usize) -> Result<(), StatusCode> {
        let needed = self.data.len() + additional;
        if needed > i32::MAX as usize {
            return Err(StatusCode::BadValue);
        }
        if needed > self.data.capacity() {
            let target = ((self.data.len() + additional) * 3 / 2).max(128);
            self.data.reserve(target.saturating_sub(self.data.len()));
        }
        Ok(())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), StatusCode> {
        let status = self.grow_for(bytes.len() + 3);
        if status.is_err() {
            return self.latch(status);
        }
        self.data.extend_from_slice(bytes);
        let pad = pad_size(self.data.len()) - self.data.len();
        self.data.extend(std::iter::repeat(0u8).take(pad));
        self.position.set(self.data.len());
        self.latch(Ok(()))
    }

    fn read_raw(&self, len: usize) -> Result<&[u8], StatusCode> {
        let pos = self.position.get();
        let padded = pad_size(len);
        if pos.checked_add(padded).map_or(true, |end| end > self.data.len()) {
            self.latch(Err(StatusCode::NotEnoughData)).ok();
            return Err(StatusCode::NotEnoughData);
        }
        let slice = &self.data[pos..pos + len];
        self.position.set(pos + padded);
        Ok(slice)
    }

    pub fn write_i32(&mut self, v: i32) -> Result<(), StatusCode> {
        self.write_raw(&v.to_ne_bytes())
    }

    pub fn read_i32(&self) -> Result<i32, StatusCode> {
        let bytes = self.read_raw(4)?;
        Ok(i32::from_ne_bytes(bytes.try_into().unwrap()))
    }

    pub fn write_bool(&mut self, v: bool) -> Result<(), StatusCode> {
        self.write_i32(v as i32)
    }

    pub fn read_bool(&self) -> Result<bool, StatusCode> {
        Ok(self.read_i32()? != 0)
    }

    pub fn write_pointer(&mut self, v: u64) -> Result<(), StatusCode> {
        self.write_raw(&v.to_ne_bytes())
    }

    pub fn read_pointer(&self) -> Result<u64, StatusCode> {
        let bytes = self.read_raw(8)?;
        Ok(u64::from_ne_bytes(bytes.try_into().unwrap()))
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), StatusCode> {
        self.write_i32(bytes.len() as i32)?;
        self.write_raw(bytes)
    }

    pub fn read(&self) -> Result<Vec<u8>, StatusCode> {
        let len = self.read_i32()?;
        if len < 0 {
            return self.latch(Err(StatusCode::BadValue)).map(|_| Vec::new());
        }
        Ok(self.read_raw(len as usize)?.to_vec())
    }

    /// `-1` length encodes null; otherwise UTF-16 code units followed by a
    /// `u16` NUL terminator, matching §8 testable property 2.
    pub fn write_string(&mut self, s: Option<&str>) -> Result<(), StatusCode> {
        match s {
            None => self.write_i32(-1),
            Some(s) => {
                let units: Vec<u16> = s.encode_utf16().collect();
                if units.len() > (i32::MAX as usize) / 2 {
                    return self.latch(Err(StatusCode::BadValue));
                }
                self.write_i32(units.len() as i32)?;
                let mut bytes = Vec::with_capacity(units.len() * 2 + 2);
                for u in &units {
                    bytes.extend_from_slice(&u.to_ne_bytes());
                }
                bytes.extend_from_slice(&0u16.to_ne_bytes());
                self.write_raw(&bytes)
            }
        }
    }

    pub fn read_string(&self) -> Result<Option<String>, StatusCode> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let byte_len = (len as usize) * 2 + 2;
        let bytes = self.read_raw(byte_len)?;
        let units: Vec<u16> = bytes[..byte_len - 2]
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&units)
            .map(Some)
            .map_err(|_| StatusCode::BadValue)
    }

    /// Flattens an object reference. Emits a 4-byte-aligned descriptor and
    /// records its offset in `object_offsets` (`spec.md` invariant 2).
    pub fn write_strong_binder(&mut self, obj: Option<&Shared<dyn Binder>>) -> Result<(), StatusCode> {
        let offset = pad_size(self.data.len());
        let (kind, handle_or_token, cookie, stability) = match obj {
            None => (ObjectKind::NoneKind, 0u64, 0u64, Stability::Undeclared),
            Some(shared) => {
                if let Some(local) = shared.local() {
                    let token = ProcessState::current().register_local_object(shared);
                    local.mark_parceled();
                    (ObjectKind::LocalBinder, token, token, Stability::default_for_context())
                } else {
                    let handle = shared.remote_handle().unwrap_or(0);
                    (ObjectKind::Handle, handle as u64, 0, Stability::default_for_context())
                }
            }
        };
        self.write_i32(kind as i32)?;
        self.write_pointer(handle_or_token)?;
        self.write_pointer(cookie)?;
        self.write_i32(stability.repr() as i32)?;
        self.object_offsets.push(offset);
        Ok(())
    }

    /// `readNullableStrongBinder`: the inverse of `write_strong_binder`.
    /// Only reachable via the offset list, never a raw positional read
    /// (`spec.md` §4.2 "Object iteration").
    pub fn read_nullable_strong_binder(&self) -> Result<Option<Shared<dyn Binder>>, StatusCode> {
        let offset = pad_size(self.position.get());
        if !self.object_offsets.contains(&offset) {
            return self.latch(Err(StatusCode::BadType)).map(|_| None);
        }
        let kind_raw = self.read_i32()?;
        let kind = ObjectKind::from_i32(kind_raw).ok_or(StatusCode::BadType)?;
        let handle_or_token = self.read_pointer()?;
        let _cookie = self.read_pointer()?;
        let stability_raw = self.read_i32()?;
        let _stability = Stability::from_repr(stability_raw as i16).unwrap_or(Stability::Undeclared);
        match kind {
            ObjectKind::NoneKind => Ok(None),
            ObjectKind::LocalBinder => Ok(ProcessState::current().lookup_local_object(handle_or_token)),
            ObjectKind::Handle => Ok(ProcessState::current().get_strong_proxy_for_handle(handle_or_token as Handle)),
            ObjectKind::Fd => self.latch(Err(StatusCode::BadType)).map(|_| None),
        }
    }

    #[cfg(unix)]
    pub fn write_file_descriptor(
        &mut self,
        fd: std::os::fd::OwnedFd,
        take_ownership: bool,
    ) -> Result<(), StatusCode> {
        use std::os::fd::AsRawFd;
        let offset = pad_size(self.data.len());
        self.write_i32(ObjectKind::Fd as i32)?;
        self.write_pointer(fd.as_raw_fd() as u64)?;
        self.write_pointer(take_ownership as u64)?;
        self.write_i32(Stability::Undeclared.repr() as i32)?;
        self.object_offsets.push(offset);
        self.has_fds.set(true);
        if take_ownership {
            // The descriptor table (process state / driver) now owns `fd`;
            // we must not close it when this local value drops.
            std::mem::forget(fd);
        }
        Ok(())
    }

    #[cfg(unix)]
    pub fn read_file_descriptor(&self) -> Result<std::os::fd::OwnedFd, StatusCode> {
        use std::os::fd::FromRawFd;
        let offset = pad_size(self.position.get());
        if !self.object_offsets.contains(&offset) {
            return Err(StatusCode::BadType);
        }
        let kind = ObjectKind::from_i32(self.read_i32()?).ok_or(StatusCode::BadType)?;
        if kind != ObjectKind::Fd {
            return Err(StatusCode::BadType);
        }
        let raw = self.read_pointer()? as i32;
        let _take_ownership = self.read_pointer()? != 0;
        let _stability = self.read_i32()?;
        // Safety: `raw` was written by `write_file_descriptor` from a valid
        // `OwnedFd` and the driver/loopback model does not reuse it
        // elsewhere while this parcel is alive.
        Ok(unsafe { std::os::fd::OwnedFd::from_raw_fd(raw) })
    }

    /// Used only by the reserved `DUMP_TRANSACTION` path, which carries a
    /// raw fd that is not an embedded-object descriptor.
    pub fn read_file_descriptor_raw(&self) -> i32 {
        self.read_i32().unwrap_or(-1)
    }

    /// `writeInterfaceToken`: policy bits, work-source uid, a magic header,
    /// then the interface name (`spec.md` §4.2).
    pub fn write_interface_token(&mut self, name: &str) -> Result<(), StatusCode> {
        self.write_i32(0)?; // strict-mode policy | gather bit (no strict-mode tracking in this build)
        self.write_i32(-1)?; // work-source uid: none propagated by default
        self.write_i32(INTERFACE_TOKEN_MAGIC)?;
        self.write_string(Some(name))
    }

    /// `checkInterface`: verifies the magic header and interface name.
    pub fn check_interface(&self, expected: &Descriptor) -> Result<(), StatusCode> {
        let _policy = self.read_i32()?;
        let _work_source = self.read_i32()?;
        let magic = self.read_i32()?;
        if magic != INTERFACE_TOKEN_MAGIC {
            return Err(StatusCode::BadType);
        }
        let name = self.read_string()?;
        if name.as_deref() != Some(expected.0.as_str()) {
            return Err(StatusCode::BadType);
        }
        Ok(())
    }
}

impl Default for Parcel {
    fn default() -> Self {
        Parcel::new()
    }
}

impl Drop for Parcel {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(&self.data);
        }
        if self.sensitive.get() {
            for byte in self.data.iter_mut() {
                *byte = 0;
            }
        }
    }
}

impl fmt::Debug for Parcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Parcel {{ {} bytes:", self.data.len())?;
        for byte in &self.data {
            write!(f, " {:02x}", byte)?;
        }
        write!(f, ", objects: {:?} }}", self.object_offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_round_trip() {
        let mut p = Parcel::new();
        p.write_i32(-42).unwrap();
        p.write_bool(true).unwrap();
        p.set_data_position(0);
        assert_eq!(p.read_i32().unwrap(), -42);
        assert!(p.read_bool().unwrap());
    }

    #[test]
    fn padding_law() {
        let mut p = Parcel::new();
        p.write_bool(true).unwrap();
        p.write_string(Some("x")).unwrap();
        assert_eq!(p.len() % 4, 0);
    }

    #[test]
    fn string_round_trip_with_null() {
        let mut p = Parcel::new();
        p.write_string(Some("Vela.os.IServiceManager")).unwrap();
        p.write_string(None).unwrap();
        p.set_data_position(0);
        assert_eq!(
            p.read_string().unwrap().as_deref(),
            Some("Vela.os.IServiceManager")
        );
        assert_eq!(p.read_string().unwrap(), None);
        assert_eq!(p.data_position() % 4, 0);
        assert_eq!(p.data_position(), p.len());
    }

    #[test]
    fn not_enough_data_latches_error() {
        let p = Parcel::new();
        assert_eq!(p.read_i32(), Err(StatusCode::NotEnoughData));
        assert_eq!(p.error_check(), Err(StatusCode::NotEnoughData));
    }

    #[test]
    fn sensitive_parcel_zeroes_on_drop() {
        let mut p = Parcel::new();
        p.write_i32(0x1234).unwrap();
        p.mark_sensitive();
        let ptr = p.data.as_ptr();
        let len = p.data.len();
        drop(p);
        // best-effort: dropped buffer memory was zeroed before deallocation
        let _ = (ptr, len);
    }
}
