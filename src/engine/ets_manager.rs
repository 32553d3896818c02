//! Binding to the vendor `ETSManager` library.
//!
//! The library's callbacks carry no user data pointer, so the active
//! callbacks live in one process-wide slot. They are cloned out of the slot
//! before every call so a blocking prompt never holds the lock.

use std::ffi::{CStr, CString, c_char, c_void};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::{Engine, EngineCallbacks};
use crate::codec::TextEncoding;

type DeviceSearchFn =
    unsafe extern "system" fn(*const c_char, *const c_char, *const c_char) -> bool;
type DongleMessageFn = unsafe extern "system" fn(*const c_char) -> bool;
type UseAutoImplicitSendFn = unsafe extern "C" fn() -> bool;
type AutoImplicitSendFn = unsafe extern "C" fn(*mut c_char, u32) -> *mut c_char;
type LogFn = unsafe extern "system" fn(
    *const c_char,
    *const c_char,
    *const c_char,
    i32,
    *mut c_void,
) -> bool;

#[link(name = "ETSManager")]
unsafe extern "C" {
    fn RegisterProfileWithCallbacks(
        profile: *const c_char,
        use_auto_implicit_send: UseAutoImplicitSendFn,
        auto_implicit_send: AutoImplicitSendFn,
        log: LogFn,
        device_search: DeviceSearchFn,
        dongle_message: DongleMessageFn,
    ) -> bool;
    fn InitGetDevInfoWithCallbacks(
        install_dir: *const c_char,
        device_search: DeviceSearchFn,
        dongle_message: DongleMessageFn,
    ) -> bool;
    fn GetDeviceList() -> *const c_char;
    fn SetPTSDevice(device: *const c_char);
    fn VerifyDongleEx() -> bool;
    fn GetDongleBDAddress() -> u64;
    fn GetDongleDeviceInformation();
    fn SetParameterEx(
        name: *const c_char,
        value_type: *const c_char,
        value: *const c_char,
        profile: *const c_char,
    ) -> bool;
    fn InitEtsEx(
        profile: *const c_char,
        workspace: *const c_char,
        implicit_send_library: *const c_char,
        dongle_address: *const c_char,
    ) -> bool;
    fn InitStackEx(profile: *const c_char) -> bool;
    fn SetPostLoggingEx(enabled: bool, profile: *const c_char);
    fn StartTestCaseEx(test_case: *const c_char, profile: *const c_char, max_log: bool) -> bool;
    fn TestCaseFinishedEx(test_case: *const c_char, profile: *const c_char) -> bool;
    fn ExitStackEx(profile: *const c_char) -> bool;
    fn UnregisterProfileEx(profile: *const c_char) -> bool;
    fn UnRegisterGetDevInfoEx() -> bool;
}

type Hkey = *mut c_void;

// Predefined handles are sign-extended 32-bit values.
const HKEY_LOCAL_MACHINE: Hkey = 0x8000_0002_u32 as i32 as isize as Hkey;
const REG_OPTION_NON_VOLATILE: u32 = 0;
const KEY_ALL_ACCESS: u32 = 0x000F_003F;
const REG_SZ: u32 = 1;
const ERROR_SUCCESS: i32 = 0;

#[link(name = "advapi32")]
unsafe extern "system" {
    fn RegCreateKeyExA(
        key: Hkey,
        sub_key: *const c_char,
        reserved: u32,
        class: *mut c_char,
        options: u32,
        sam_desired: u32,
        security_attributes: *mut c_void,
        result: *mut Hkey,
        disposition: *mut u32,
    ) -> i32;
    fn RegSetValueExA(
        key: Hkey,
        value_name: *const c_char,
        reserved: u32,
        value_type: u32,
        data: *const u8,
        data_len: u32,
    ) -> i32;
    fn RegCloseKey(key: Hkey) -> i32;
}

/// Device class of serial ports.
const PORTS_CLASS_GUID: &str = "{4D36E978-E325-11CE-BFC1-08002BE10318}";
const VIRTUAL_DEVICE_KEY: &str = r"System\CurrentControlSet\Enum\VIRTUAL\VID_1915&PID_521F";

static ACTIVE: Mutex<Option<Arc<dyn EngineCallbacks>>> = Mutex::new(None);

fn active() -> Option<Arc<dyn EngineCallbacks>> {
    ACTIVE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn install(callbacks: Arc<dyn EngineCallbacks>) {
    *ACTIVE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(callbacks);
}

fn clear() {
    ACTIVE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
}

/// Borrow a C string as bytes; null reads as empty.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives the
/// returned slice.
unsafe fn bytes<'a>(ptr: *const c_char) -> &'a [u8] {
    if ptr.is_null() {
        return &[];
    }
    // SAFETY: non-null and NUL-terminated per the caller's contract.
    unsafe { CStr::from_ptr(ptr) }.to_bytes()
}

unsafe extern "system" fn on_device_found(
    address: *const c_char,
    name: *const c_char,
    class_of_device: *const c_char,
) -> bool {
    let Some(callbacks) = active() else {
        return true;
    };
    // SAFETY: the engine passes valid strings for the duration of the call.
    unsafe { callbacks.on_device_found(bytes(address), bytes(name), bytes(class_of_device)) }
}

unsafe extern "system" fn on_dongle_message(message: *const c_char) -> bool {
    let Some(callbacks) = active() else {
        return true;
    };
    // SAFETY: as above.
    unsafe { callbacks.on_dongle_message(bytes(message)) }
}

unsafe extern "C" fn on_use_auto_implicit_send() -> bool {
    active().is_some_and(|callbacks| callbacks.use_auto_implicit_send())
}

unsafe extern "C" fn on_implicit_send(description: *mut c_char, style: u32) -> *mut c_char {
    let answer = match active() {
        // SAFETY: as above.
        Some(callbacks) => unsafe { callbacks.on_implicit_send(bytes(description), style) },
        None => Vec::new(),
    };
    // The engine keeps the answer buffer; it is never reclaimed.
    let answer: Vec<u8> = answer.into_iter().filter(|b| *b != 0).collect();
    match CString::new(answer) {
        Ok(answer) => answer.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

unsafe extern "system" fn on_log(
    time: *const c_char,
    description: *const c_char,
    message: *const c_char,
    logtype: i32,
    _project: *mut c_void,
) -> bool {
    let Some(callbacks) = active() else {
        return true;
    };
    // SAFETY: as above.
    unsafe { callbacks.on_log(bytes(time), bytes(description), bytes(message), logtype) }
}

/// The vendor engine, loaded from `ETSManager.dll`.
pub struct EtsManager {
    encoding: TextEncoding,
}

impl EtsManager {
    /// `encoding` is the code page the engine expects for outbound strings.
    pub fn new(encoding: TextEncoding) -> Self {
        Self { encoding }
    }

    fn c_string(&self, text: &str) -> Option<CString> {
        match CString::new(self.encoding.encode(text)) {
            Ok(text) => Some(text),
            Err(_) => {
                warn!(text, "string contains NUL; not passed to the engine");
                None
            }
        }
    }

    fn c_path(&self, path: &Path) -> Option<CString> {
        self.c_string(&path.to_string_lossy())
    }

    fn register_port(&self, port: &str) -> Result<(), i32> {
        let key_name = self
            .c_string(&format!(r"{VIRTUAL_DEVICE_KEY}\{port}"))
            .ok_or(-1)?;
        let mut key: Hkey = std::ptr::null_mut();
        // SAFETY: all pointers are valid for the call; `key` receives the handle.
        let status = unsafe {
            RegCreateKeyExA(
                HKEY_LOCAL_MACHINE,
                key_name.as_ptr(),
                0,
                std::ptr::null_mut(),
                REG_OPTION_NON_VOLATILE,
                KEY_ALL_ACCESS,
                std::ptr::null_mut(),
                &mut key,
                std::ptr::null_mut(),
            )
        };
        if status != ERROR_SUCCESS {
            return Err(status);
        }

        let result = set_string_value(key, c"ClassGUID", PORTS_CLASS_GUID)
            .and_then(|()| set_string_value(key, c"FriendlyName", &format!("HCI ({port})")));
        // SAFETY: `key` was opened above.
        unsafe { RegCloseKey(key) };
        result
    }
}

fn set_string_value(key: Hkey, name: &CStr, value: &str) -> Result<(), i32> {
    let data = CString::new(value).map_err(|_| -1)?;
    let data = data.as_bytes_with_nul();
    let len = u32::try_from(data.len()).map_err(|_| -1)?;
    // SAFETY: `key` is an open handle and `data` is valid for `len` bytes.
    let status = unsafe { RegSetValueExA(key, name.as_ptr(), 0, REG_SZ, data.as_ptr(), len) };
    if status == ERROR_SUCCESS {
        Ok(())
    } else {
        Err(status)
    }
}

impl Engine for EtsManager {
    fn register_profile(&self, profile: &str, callbacks: Arc<dyn EngineCallbacks>) -> bool {
        let Some(profile) = self.c_string(profile) else {
            return false;
        };
        install(callbacks);
        // SAFETY: trampolines match the engine's callback signatures.
        unsafe {
            RegisterProfileWithCallbacks(
                profile.as_ptr(),
                on_use_auto_implicit_send,
                on_implicit_send,
                on_log,
                on_device_found,
                on_dongle_message,
            )
        }
    }

    fn init_device_discovery(
        &self,
        install_dir: &Path,
        callbacks: Arc<dyn EngineCallbacks>,
    ) -> bool {
        let Some(install_dir) = self.c_path(install_dir) else {
            return false;
        };
        install(callbacks);
        // SAFETY: as above.
        unsafe {
            InitGetDevInfoWithCallbacks(install_dir.as_ptr(), on_device_found, on_dongle_message)
        }
    }

    fn provision_port(&self, port: &str) -> bool {
        match self.register_port(port) {
            Ok(()) => true,
            Err(status) => {
                warn!(port, status, "failed to register port in the device registry");
                false
            }
        }
    }

    fn device_list(&self) -> String {
        // SAFETY: the engine returns a NUL-terminated string it owns.
        let list = unsafe { bytes(GetDeviceList()) };
        self.encoding.decode(list)
    }

    fn select_device(&self, port: &str) {
        if let Some(port) = self.c_string(port) {
            // SAFETY: valid C string for the call.
            unsafe { SetPTSDevice(port.as_ptr()) }
        }
    }

    fn verify_dongle(&self) -> bool {
        // SAFETY: no arguments.
        unsafe { VerifyDongleEx() }
    }

    fn dongle_address(&self) -> u64 {
        // SAFETY: no arguments.
        unsafe { GetDongleBDAddress() }
    }

    fn query_dongle_information(&self) {
        // SAFETY: no arguments.
        unsafe { GetDongleDeviceInformation() }
    }

    fn set_parameter(&self, name: &str, value_type: &str, value: &str, profile: &str) -> bool {
        let (Some(name), Some(value_type), Some(value), Some(profile)) = (
            self.c_string(name),
            self.c_string(value_type),
            self.c_string(value),
            self.c_string(profile),
        ) else {
            return false;
        };
        // SAFETY: valid C strings for the call.
        unsafe {
            SetParameterEx(
                name.as_ptr(),
                value_type.as_ptr(),
                value.as_ptr(),
                profile.as_ptr(),
            )
        }
    }

    fn init_ets(
        &self,
        profile: &str,
        workspace: &str,
        implicit_send_library: &Path,
        dongle_address: &str,
    ) -> bool {
        let (Some(profile), Some(workspace), Some(library), Some(address)) = (
            self.c_string(profile),
            self.c_string(workspace),
            self.c_path(implicit_send_library),
            self.c_string(dongle_address),
        ) else {
            return false;
        };
        // SAFETY: valid C strings for the call.
        unsafe {
            InitEtsEx(
                profile.as_ptr(),
                workspace.as_ptr(),
                library.as_ptr(),
                address.as_ptr(),
            )
        }
    }

    fn init_stack(&self, profile: &str) -> bool {
        let Some(profile) = self.c_string(profile) else {
            return false;
        };
        // SAFETY: valid C string for the call.
        unsafe { InitStackEx(profile.as_ptr()) }
    }

    fn set_post_logging(&self, enabled: bool, profile: &str) {
        if let Some(profile) = self.c_string(profile) {
            // SAFETY: valid C string for the call.
            unsafe { SetPostLoggingEx(enabled, profile.as_ptr()) }
        }
    }

    fn start_test_case(&self, test_case: &str, profile: &str, max_log: bool) -> bool {
        let (Some(test_case), Some(profile)) = (self.c_string(test_case), self.c_string(profile))
        else {
            return false;
        };
        // SAFETY: valid C strings for the call.
        unsafe { StartTestCaseEx(test_case.as_ptr(), profile.as_ptr(), max_log) }
    }

    fn test_case_finished(&self, test_case: &str, profile: &str) -> bool {
        let (Some(test_case), Some(profile)) = (self.c_string(test_case), self.c_string(profile))
        else {
            return false;
        };
        // SAFETY: valid C strings for the call.
        unsafe { TestCaseFinishedEx(test_case.as_ptr(), profile.as_ptr()) }
    }

    fn exit_stack(&self, profile: &str) -> bool {
        let Some(profile) = self.c_string(profile) else {
            return false;
        };
        // SAFETY: valid C string for the call.
        unsafe { ExitStackEx(profile.as_ptr()) }
    }

    fn unregister_profile(&self, profile: &str) -> bool {
        let Some(profile) = self.c_string(profile) else {
            return false;
        };
        // SAFETY: valid C string for the call.
        let ok = unsafe { UnregisterProfileEx(profile.as_ptr()) };
        debug!(ok, "profile unregistered");
        ok
    }

    fn unregister_device_discovery(&self) -> bool {
        // SAFETY: no arguments.
        let ok = unsafe { UnRegisterGetDevInfoEx() };
        clear();
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_machine_handle_is_sign_extended() {
        assert_eq!(HKEY_LOCAL_MACHINE as isize, -0x7FFF_FFFE);
        assert_eq!(HKEY_LOCAL_MACHINE as usize as u32, 0x8000_0002);
    }

    #[test]
    fn outbound_strings_use_the_engine_code_page() {
        let engine = EtsManager::new(TextEncoding::Windows1252);
        let text = engine.c_string("caf\u{e9} \u{2013}").unwrap();
        assert_eq!(text.as_bytes(), b"caf\xe9 \x96");
        assert!(engine.c_string("nul\0inside").is_none());
    }
}
