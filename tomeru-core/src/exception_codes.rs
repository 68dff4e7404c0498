//! 例外コードの種類
//!
//! 実行ループは、初回例外を止めるかどうかを種類ごとのビットで決める。
//! コード値はWindowsの例外コード体系に合わせてあり、
//! Linuxバックエンドはシグナルをこのうちのいくつかに対応づける。

/// 例外コードの種類と値、表示名
macro_rules! exception_code_kinds {
    ($($kind:ident = $code:expr, $name:expr;)*) => {
        /// 既知の例外コード
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ExceptionCodeKind {
            $($kind,)*
        }

        impl ExceptionCodeKind {
            /// すべての種類
            pub const ALL: &'static [ExceptionCodeKind] = &[$(ExceptionCodeKind::$kind,)*];

            /// 例外コード
            pub fn code(self) -> u32 {
                match self {
                    $(ExceptionCodeKind::$kind => $code,)*
                }
            }

            /// 表示名
            pub fn display_name(self) -> &'static str {
                match self {
                    $(ExceptionCodeKind::$kind => $name,)*
                }
            }
        }
    };
}

exception_code_kinds! {
    Win32CtrlC = 0x4001_0005, "Control-C";
    Win32CtrlBreak = 0x4001_0008, "Control-Break";
    WinRtOriginateError = 0x4008_0201, "WinRT Originate Error";
    WinRtTransformError = 0x4008_0202, "WinRT Transform Error";
    RpcCallCancelled = 0x0000_071A, "Remote Procedure Call Cancelled";
    DatatypeMisalignment = 0x8000_0002, "Datatype Misalignment";
    AccessViolation = 0xC000_0005, "Access Violation";
    InPageError = 0xC000_0006, "In Page Error";
    InvalidHandle = 0xC000_0008, "Invalid Handle";
    NotEnoughQuota = 0xC000_0017, "Not Enough Quota";
    IllegalInstruction = 0xC000_001D, "Illegal Instruction";
    CannotContinueException = 0xC000_0025, "Cannot Continue Exception";
    InvalidExceptionDisposition = 0xC000_0026, "Invalid Exception Disposition";
    ArrayBoundsExceeded = 0xC000_008C, "Array Bounds Exceeded";
    FloatingPointDenormalOperand = 0xC000_008D, "Floating-Point Denormal Operand";
    FloatingPointDivisionByZero = 0xC000_008E, "Floating-Point Division By Zero";
    FloatingPointInexactResult = 0xC000_008F, "Floating-Point Inexact Result";
    FloatingPointInvalidOperation = 0xC000_0090, "Floating-Point Invalid Operation";
    FloatingPointOverflow = 0xC000_0091, "Floating-Point Overflow";
    FloatingPointStackCheck = 0xC000_0092, "Floating-Point Stack Check";
    FloatingPointUnderflow = 0xC000_0093, "Floating-Point Underflow";
    IntegerDivisionByZero = 0xC000_0094, "Integer Division By Zero";
    IntegerOverflow = 0xC000_0095, "Integer Overflow";
    PrivilegedInstruction = 0xC000_0096, "Privileged Instruction";
    StackOverflow = 0xC000_00FD, "Stack Overflow";
    UnableToLocateDll = 0xC000_0135, "Unable To Locate DLL";
    OrdinalNotFound = 0xC000_0138, "Ordinal Not Found";
    EntryPointNotFound = 0xC000_0139, "Entry Point Not Found";
    DllInitializationFailed = 0xC000_0142, "DLL Initialization Failed";
    FloatingPointSseMultipleFaults = 0xC000_02B4, "Floating-Point SSE Multiple Faults";
    FloatingPointSseMultipleTraps = 0xC000_02B5, "Floating-Point SSE Multiple Traps";
    AssertionFailed = 0xC000_0420, "Assertion Failed";
    ModuleNotFound = 0xC06D_007E, "Module Not Found";
    ProcedureNotFound = 0xC06D_007F, "Procedure Not Found";
    SanitizerErrorDetected = 0xE073_616E, "Sanitizer Error Detected";
    SanitizerRawAccessViolation = 0xE073_6171, "Sanitizer Raw Access Violation";
    DirectXDebugLayer = 0x0000_087A, "DirectX Debug Layer";
}

impl ExceptionCodeKind {
    /// コードから種類を引く
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.code() == code)
    }

    /// フィルタのビット位置
    pub fn bit(self) -> u32 {
        Self::ALL.iter().position(|k| *k == self).unwrap_or(0) as u32
    }
}

/// 初回例外で止める種類のビット集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ExceptionCodeFilter(pub u64);

impl ExceptionCodeFilter {
    /// 既定で止める種類（アクセス違反など致命的なもの）
    pub fn default_stops() -> Self {
        let mut filter = Self(0);
        for kind in [
            ExceptionCodeKind::AccessViolation,
            ExceptionCodeKind::IllegalInstruction,
            ExceptionCodeKind::IntegerDivisionByZero,
            ExceptionCodeKind::StackOverflow,
            ExceptionCodeKind::InPageError,
            ExceptionCodeKind::PrivilegedInstruction,
            ExceptionCodeKind::SanitizerErrorDetected,
        ] {
            filter.set(kind, true);
        }
        filter
    }

    pub fn set(&mut self, kind: ExceptionCodeKind, enabled: bool) {
        let bit = 1u64 << kind.bit();
        if enabled {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn contains(&self, kind: ExceptionCodeKind) -> bool {
        self.0 & (1u64 << kind.bit()) != 0
    }

    /// コードがフィルタで有効か（未知のコードは無効）
    pub fn stops_on_code(&self, code: u32) -> bool {
        ExceptionCodeKind::from_code(code)
            .map(|k| self.contains(k))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_lookup() {
        assert_eq!(
            ExceptionCodeKind::from_code(0xC000_0005),
            Some(ExceptionCodeKind::AccessViolation)
        );
        assert_eq!(ExceptionCodeKind::from_code(0x1234), None);
        assert!(ExceptionCodeKind::ALL.len() <= 64);
        assert_eq!(ExceptionCodeKind::StackOverflow.display_name(), "Stack Overflow");
    }

    #[test]
    fn test_filter_bits() {
        let mut filter = ExceptionCodeFilter::default();
        assert!(!filter.stops_on_code(0xC000_0005));
        filter.set(ExceptionCodeKind::AccessViolation, true);
        assert!(filter.stops_on_code(0xC000_0005));
        assert!(!filter.stops_on_code(0xC000_0094));
        filter.set(ExceptionCodeKind::AccessViolation, false);
        assert_eq!(filter, ExceptionCodeFilter::default());
        assert!(ExceptionCodeFilter::default_stops().contains(ExceptionCodeKind::StackOverflow));
    }
}
