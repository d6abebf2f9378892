//! Decoding of vendor result codes attached to failed live response commands.
//!
//! Windows sensors report failures as an HRESULT (`result_type` =
//! `"WinHresult"`) or, less often, an NTSTATUS (`"WinNtStatus"`). Only the
//! codes that show up in practice are tabulated; anything else decodes to
//! `None` and the caller falls back to a generic message.

/// HRESULT facility for wrapped Win32 error codes (`0x8007xxxx`).
const FACILITY_WIN32: u64 = 7;

const WIN32_ERRORS: &[(u64, &str)] = &[
    (1, "Incorrect function."),
    (2, "The system cannot find the file specified."),
    (3, "The system cannot find the path specified."),
    (5, "Access is denied."),
    (6, "The handle is invalid."),
    (8, "Not enough memory resources are available to process this command."),
    (15, "The system cannot find the drive specified."),
    (32, "The process cannot access the file because it is being used by another process."),
    (80, "The file exists."),
    (87, "The parameter is incorrect."),
    (112, "There is not enough space on the disk."),
    (123, "The filename, directory name, or volume label syntax is incorrect."),
    (145, "The directory is not empty."),
    (183, "Cannot create a file when that file already exists."),
    (206, "The filename or extension is too long."),
    (267, "The directory name is invalid."),
    (1008, "An attempt was made to reference a token that does not exist."),
    (1018, "Illegal operation attempted on a registry key that has been marked for deletion."),
    (1460, "This operation returned because the timeout period expired."),
];

const HRESULTS: &[(u64, &str)] = &[
    (0x8000_4001, "Not implemented."),
    (0x8000_4004, "Operation aborted."),
    (0x8000_4005, "Unspecified error."),
    (0x8000_FFFF, "Catastrophic failure."),
    (0x8007_000E, "Ran out of memory."),
    (0x8007_0057, "One or more arguments are invalid."),
];

const NTSTATUS: &[(u64, &str)] = &[
    (0xC000_0005, "Access violation."),
    (0xC000_0008, "An invalid handle was specified."),
    (0xC000_0022, "A process has requested access to an object but has not been granted those access rights."),
    (0xC000_0034, "The object name is not found."),
    (0xC000_003A, "The object path component was not a directory object."),
    (0xC000_0043, "A file cannot be opened because the share access flags are incompatible."),
];

fn lookup(table: &[(u64, &'static str)], code: u64) -> Option<&'static str> {
    table
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, msg)| *msg)
}

/// Decodes `code` within the `result_type` namespace into a readable string.
pub fn decode_result_code(result_type: &str, code: u64) -> Option<&'static str> {
    match result_type {
        "WinHresult" => {
            if let Some(msg) = lookup(HRESULTS, code) {
                return Some(msg);
            }
            let facility = (code >> 16) & 0x1FFF;
            let is_failure = code & 0x8000_0000 != 0;
            if is_failure && facility == FACILITY_WIN32 {
                lookup(WIN32_ERRORS, code & 0xFFFF)
            } else {
                None
            }
        }
        "WinNtStatus" => lookup(NTSTATUS, code),
        "Win32" | "WinError" => lookup(WIN32_ERRORS, code),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn win32_facility_hresult_decodes_through_win32_table() {
        assert_eq!(
            decode_result_code("WinHresult", 0x8007_0005),
            Some("Access is denied.")
        );
        assert_eq!(
            decode_result_code("WinHresult", 0x8007_0091),
            Some("The directory is not empty.")
        );
    }

    #[test]
    fn generic_hresult_decodes_directly() {
        assert_eq!(
            decode_result_code("WinHresult", 0x8000_4005),
            Some("Unspecified error.")
        );
    }

    #[test]
    fn success_hresult_is_not_decoded_as_win32() {
        // Facility 7 but severity bit clear.
        assert_eq!(decode_result_code("WinHresult", 0x0007_0002), None);
    }

    #[test]
    fn ntstatus_and_unknown_types() {
        assert_eq!(
            decode_result_code("WinNtStatus", 0xC000_0034),
            Some("The object name is not found.")
        );
        assert_eq!(decode_result_code("Posix", 2), None);
    }
}
