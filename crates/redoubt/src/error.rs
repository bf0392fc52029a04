macro_rules! bail {
    ($($arg:expr),* $(,)?) => {
        return Err(crate::error::Error::from_display(format_args!($($arg),*)))
    }
}

pub(crate) use bail;

#[derive(Debug)]
enum ErrorKind {
    Owned(String),
    Static(&'static str),
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    Os(redoubt_linux_raw::Error),
}

#[derive(Debug)]
#[repr(transparent)]
pub struct Error(ErrorKind);

impl From<String> for Error {
    #[cold]
    fn from(string: String) -> Self {
        Error(ErrorKind::Owned(string))
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl From<redoubt_linux_raw::Error> for Error {
    #[cold]
    fn from(error: redoubt_linux_raw::Error) -> Self {
        Error(ErrorKind::Os(error))
    }
}

impl Error {
    #[cold]
    pub(crate) fn from_display(message: impl core::fmt::Display) -> Self {
        Error(ErrorKind::Owned(message.to_string()))
    }

    #[cold]
    pub(crate) fn from_static_str(message: &'static str) -> Self {
        Error(ErrorKind::Static(message))
    }

    #[cold]
    pub(crate) fn context(self, message: impl core::fmt::Display) -> Self {
        Error(ErrorKind::Owned(format!("{}: {}", message, self)))
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        match &self.0 {
            ErrorKind::Owned(message) => fmt.write_str(message),
            ErrorKind::Static(message) => fmt.write_str(message),
            #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
            ErrorKind::Os(error) => error.fmt(fmt),
        }
    }
}

impl std::error::Error for Error {}
