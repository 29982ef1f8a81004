//! Wire-level constants: opcode assignments, the protocol version string,
//! and the handshake sentinel. These are a stable numeric contract — two
//! peers built against different assignments will not interoperate, so
//! nothing here may be renumbered without bumping [`PROTOCOL_VERSION`].

/// Compiled protocol version, checked byte-for-byte on `InitServer`.
pub const PROTOCOL_VERSION: &str = "minrpc-0.1";

/// Remote-key sentinel: a server constructed with this key reads the
/// client's actual key off the wire during the handshake instead of
/// having one supplied by the embedder.
pub const TOINIT_KEY: &str = "%toinit";

/// First syscall opcode. Any opcode `>= SYSCALL_CODE_START` is dispatched
/// through the uniform syscall handler rather than matched individually.
pub const SYSCALL_CODE_START: u32 = 16;

macro_rules! opcodes {
    ($($name:ident = $val:expr),+ $(,)?) => {
        /// A packet opcode. Control codes occupy the low range; syscalls
        /// begin at [`SYSCALL_CODE_START`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum Opcode {
            $($name = $val),+
        }

        impl Opcode {
            #[must_use]
            pub const fn from_u32(v: u32) -> Option<Self> {
                match v {
                    $($val => Some(Self::$name),)+
                    _ => None,
                }
            }

            #[must_use]
            pub const fn as_u32(self) -> u32 {
                self as u32
            }
        }
    };
}

opcodes! {
    None = 0,
    Shutdown = 1,
    InitServer = 2,
    CallFunc = 3,
    Return = 4,
    Exception = 5,
    CopyFromRemote = 6,
    CopyToRemote = 7,
    CopyAck = 8,

    GetGlobalFunc = 16,
    FreeHandle = 17,
    DevSetDevice = 18,
    DevGetAttr = 19,
    DevAllocData = 20,
    DevFreeData = 21,
    DevStreamSync = 22,
    CopyAmongRemote = 23,
    DevCreateStream = 24,
    DevFreeStream = 25,
    DevSetStream = 26,
    DevGetCurrentStream = 27,
    DevAllocDataWithScope = 28,
}

impl Opcode {
    /// True for any syscall opcode, i.e. anything at or past
    /// [`SYSCALL_CODE_START`].
    #[must_use]
    pub const fn is_syscall(self) -> bool {
        self.as_u32() >= SYSCALL_CODE_START
    }
}
