// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Status-code vocabulary and the reply-body exception format.
//!
//! `StatusCode` is the stable, small-integer wire status (`spec.md` §6,
//! §8); `Exception` is the richer structure carried inside reply parcels,
//! mirroring `original_source/binderlib/base/Status.c`.

use std::fmt;

/// The stable status-code vocabulary shared between the driver, the parcel
/// primitives and the generated stub/proxy layer.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    #[error("ok")]
    Ok = 0,
    #[error("unknown error")]
    UnknownError = i32::MIN,
    #[error("no memory")]
    NoMemory = -12,
    #[error("invalid operation")]
    InvalidOperation = -38,
    #[error("bad value")]
    BadValue = -22,
    #[error("bad type")]
    BadType = i32::MIN + 1,
    #[error("name not found")]
    NameNotFound = -2,
    #[error("permission denied")]
    PermissionDenied = -1,
    #[error("not initialized")]
    NoInit = -19,
    #[error("already exists")]
    AlreadyExists = -17,
    #[error("dead object")]
    DeadObject = -32,
    #[error("failed transaction")]
    FailedTransaction = i32::MIN + 2,
    #[error("unknown transaction")]
    UnknownTransaction = i32::MIN + 3,
    #[error("file descriptors not allowed")]
    FdsNotAllowed = i32::MIN + 4,
    #[error("unexpected null")]
    UnexpectedNull = i32::MIN + 5,
    #[error("would block")]
    WouldBlock = -11,
    #[error("timed out")]
    TimedOut = -110,
    #[error("unknown error code")]
    UnknownErrorCode = i32::MIN + 6,
    #[error("not enough data")]
    NotEnoughData = i32::MIN + 7,
}

impl StatusCode {
    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Maps a raw wire code back to a known variant, defaulting to
    /// `UnknownErrorCode` for anything not in the vocabulary -- callers
    /// should never abort on an unrecognized code coming from the driver.
    pub fn from_i32(v: i32) -> StatusCode {
        match v {
            x if x == StatusCode::Ok as i32 => StatusCode::Ok,
            x if x == StatusCode::NoMemory as i32 => StatusCode::NoMemory,
            x if x == StatusCode::InvalidOperation as i32 => StatusCode::InvalidOperation,
            x if x == StatusCode::BadValue as i32 => StatusCode::BadValue,
            x if x == StatusCode::BadType as i32 => StatusCode::BadType,
            x if x == StatusCode::NameNotFound as i32 => StatusCode::NameNotFound,
            x if x == StatusCode::PermissionDenied as i32 => StatusCode::PermissionDenied,
            x if x == StatusCode::NoInit as i32 => StatusCode::NoInit,
            x if x == StatusCode::AlreadyExists as i32 => StatusCode::AlreadyExists,
            x if x == StatusCode::DeadObject as i32 => StatusCode::DeadObject,
            x if x == StatusCode::FailedTransaction as i32 => StatusCode::FailedTransaction,
            x if x == StatusCode::UnknownTransaction as i32 => StatusCode::UnknownTransaction,
            x if x == StatusCode::FdsNotAllowed as i32 => StatusCode::FdsNotAllowed,
            x if x == StatusCode::UnexpectedNull as i32 => StatusCode::UnexpectedNull,
            x if x == StatusCode::WouldBlock as i32 => StatusCode::WouldBlock,
            x if x == StatusCode::TimedOut as i32 => StatusCode::TimedOut,
            x if x == StatusCode::NotEnoughData as i32 => StatusCode::NotEnoughData,
            x if x == StatusCode::UnknownError as i32 => StatusCode::UnknownError,
            _ => StatusCode::UnknownErrorCode,
        }
    }
}

pub type Result<T> = std::result::Result<T, StatusCode>;

/// Alias kept for readability at call sites that just want "did this
/// succeed", mirroring `android::status_t`-returning APIs.
pub type Status = Result<()>;

/// A reply-body exception code, distinct from the wire-level `StatusCode`:
/// these travel inside a successfully-delivered reply parcel and are
/// produced by the generated stub/proxy layer (`spec.md` §4.7, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExceptionCode {
    None = 0,
    Security = -1,
    BadParcelable = -2,
    IllegalArgument = -3,
    NullPointer = -4,
    IllegalState = -5,
    NetworkMainThread = -6,
    UnsupportedOperation = -7,
    ServiceSpecific = -8,
    Parcelable = -9,
    /// Not a "real" exception: the wire status code itself describes the
    /// failure (`spec.md` §7, "`FAILED_TRANSACTION` triggers special
    /// handling so the status int32 is parsed from the reply payload").
    TransactionFailed = i32::MIN,
}

/// An exception carried in a reply body: code, optional message, and an
/// optional service-specific error, matching `Status_writeToParcel` /
/// `Status_readFromParcel` in `original_source/binderlib/base/Status.c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    pub code: ExceptionCode,
    pub message: String,
    pub service_specific_error: i32,
    /// Set when `code == TransactionFailed`; carries the raw wire status.
    pub transaction_error: StatusCode,
}

impl Exception {
    pub fn ok() -> Self {
        Exception {
            code: ExceptionCode::None,
            message: String::new(),
            service_specific_error: 0,
            transaction_error: StatusCode::Ok,
        }
    }

    pub fn from_status(status: StatusCode) -> Self {
        if status.is_ok() {
            Exception::ok()
        } else {
            Exception {
                code: ExceptionCode::TransactionFailed,
                message: String::new(),
                service_specific_error: 0,
                transaction_error: status,
            }
        }
    }

    pub fn from_service_specific(code: i32, message: impl Into<String>) -> Self {
        Exception {
            code: ExceptionCode::ServiceSpecific,
            message: message.into(),
            service_specific_error: code,
            transaction_error: StatusCode::Ok,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ExceptionCode::None
    }

    /// The status that a caller should see, collapsing the exception back
    /// down to the wire vocabulary.
    pub fn to_status(&self) -> StatusCode {
        match self.code {
            ExceptionCode::None => StatusCode::Ok,
            ExceptionCode::TransactionFailed => self.transaction_error,
            _ => StatusCode::FailedTransaction,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            write!(f, "ok")
        } else {
            write!(
                f,
                "exception {:?}: {} (service_specific={})",
                self.code, self.message, self.service_specific_error
            )
        }
    }
}

impl std::error::Error for Exception {}
