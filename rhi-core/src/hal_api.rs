use std::fmt;

/// Backends this crate knows how to drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    Soft,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::Soft => "soft",
        })
    }
}

pub trait HalApi: hal::Api + 'static + hal::MaybeSendSync {
    const VARIANT: Backend;
}

impl HalApi for hal::api::Soft {
    const VARIANT: Backend = Backend::Soft;
}
