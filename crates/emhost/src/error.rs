//! Host-side configuration errors. Everything here is reported through
//! `anyhow` and can be recovered with `downcast_ref`.

use std::fmt;

/// A named export does not exist in the instantiated module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownExport {
    pub name: String,
}

impl fmt::Display for UnknownExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot call unknown function {}, make sure it is exported",
            self.name
        )
    }
}

impl std::error::Error for UnknownExport {}

/// The module needs imports the runtime does not provide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedImports {
    pub names: Vec<String>,
}

impl fmt::Display for UnresolvedImports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "module requires imports this runtime does not provide: {}",
            self.names.join(", ")
        )
    }
}

impl std::error::Error for UnresolvedImports {}

/// The module has not finished loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotReady;

impl fmt::Display for NotReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("runtime is not ready: the module is still loading")
    }
}

impl std::error::Error for NotReady {}

/// An `invoke_SIG` or `jsCall_SIG` import whose declared function type is
/// not `SIG` with a leading `i32` table index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrampolineMismatch {
    pub name: String,
    /// Signature string the name requires, index included.
    pub expected: String,
    /// Signature string of the declared type; `?` if it has none.
    pub declared: String,
}

impl fmt::Display for TrampolineMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "import {} is declared as '{}' but its name requires '{}'",
            self.name, self.declared, self.expected
        )
    }
}

impl std::error::Error for TrampolineMismatch {}
