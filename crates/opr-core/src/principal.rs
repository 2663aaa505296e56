//! Identity of the invoking user

use anyhow::{bail, Result};
use std::ffi::CStr;

/// Resolve the login name of the real user running this process
pub fn current_principal() -> Result<String> {
    let uid = unsafe { libc::getuid() };
    principal_for_uid(uid)
}

/// Resolve the login name for a uid via the password database
pub fn principal_for_uid(uid: libc::uid_t) -> Result<String> {
    let mut buf = vec![0 as libc::c_char; 1024];

    loop {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();

        let rc = unsafe {
            libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };

        if rc == libc::ERANGE && buf.len() < 1 << 20 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 {
            bail!("getpwuid failed: {}", std::io::Error::from_raw_os_error(rc));
        }
        if result.is_null() {
            bail!("getpwuid failed: no password entry for uid {}", uid);
        }

        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        return Ok(name.to_string_lossy().into_owned());
    }
}
