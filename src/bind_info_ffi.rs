use duckdb::vtab::BindInfo;
use libduckdb_sys::{
    duckdb_bind_get_named_parameter, duckdb_bind_info, duckdb_destroy_value, duckdb_free,
    duckdb_get_bool, duckdb_get_varchar, duckdb_is_null_value, duckdb_value,
};
use std::ffi::{CStr, CString};
use std::os::raw::c_void;

/// A named table-function parameter as seen at bind time.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum NamedParameter<T> {
    Missing,
    Null,
    Value(T),
}

impl<T> NamedParameter<T> {
    /// Missing and NULL both fall back to `default`.
    pub(crate) fn unwrap_or(self, default: T) -> T {
        match self {
            Self::Value(value) => value,
            Self::Missing | Self::Null => default,
        }
    }
}

pub(crate) fn get_named_parameter_varchar(
    bind: &BindInfo,
    name: &str,
) -> Result<NamedParameter<String>, Box<dyn std::error::Error>> {
    read_named_parameter(bind, name, |value| {
        // SAFETY: `value` is a live, non-NULL `duckdb_value` owned by `read_named_parameter`.
        // The returned C string is allocated by DuckDB and freed exactly once here.
        unsafe {
            let varchar = duckdb_get_varchar(value);
            if varchar.is_null() {
                return Err(format!("Failed to read named parameter '{}' as VARCHAR", name).into());
            }
            let text = CStr::from_ptr(varchar).to_string_lossy().into_owned();
            duckdb_free(varchar as *mut c_void);
            Ok(text)
        }
    })
}

pub(crate) fn get_named_parameter_bool(
    bind: &BindInfo,
    name: &str,
) -> Result<NamedParameter<bool>, Box<dyn std::error::Error>> {
    read_named_parameter(bind, name, |value| {
        // SAFETY: `value` is a live, non-NULL `duckdb_value` owned by `read_named_parameter`.
        Ok(unsafe { duckdb_get_bool(value) })
    })
}

fn read_named_parameter<T>(
    bind: &BindInfo,
    name: &str,
    read: impl FnOnce(duckdb_value) -> Result<T, Box<dyn std::error::Error>>,
) -> Result<NamedParameter<T>, Box<dyn std::error::Error>> {
    let name_cstr = CString::new(name)?;

    // SAFETY: The returned handle is owned by us and valid only for this bind callback.
    // `bind_info_ptr` provides the raw C bind handle associated with `bind`.
    let mut value =
        unsafe { duckdb_bind_get_named_parameter(bind_info_ptr(bind), name_cstr.as_ptr()) };
    if value.is_null() {
        return Ok(NamedParameter::Missing);
    }

    // SAFETY: `value` is a valid `duckdb_value` handle returned by DuckDB and is destroyed
    // exactly once below via `duckdb_destroy_value`.
    let result = if unsafe { duckdb_is_null_value(value) } {
        Ok(NamedParameter::Null)
    } else {
        read(value).map(NamedParameter::Value)
    };

    // SAFETY: `value` has not been destroyed yet and must be released once.
    unsafe {
        duckdb_destroy_value(&mut value);
    }

    result
}

fn bind_info_ptr(bind: &BindInfo) -> duckdb_bind_info {
    // SAFETY: duckdb-rs stores `duckdb_bind_info` as the only field inside
    // `duckdb::vtab::BindInfo`. The wrapper has no public raw accessor and no null-aware
    // named-parameter accessor, so this cast is needed to tell omitted and NULL apart.
    //
    // Re-check the `BindInfo` layout in duckdb-rs `src/vtab/function.rs` on upgrades.
    unsafe { *(bind as *const BindInfo as *const duckdb_bind_info) }
}
