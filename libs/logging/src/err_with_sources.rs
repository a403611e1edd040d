use std::{error::Error, fmt};

/// Formats an error followed by each of its sources, separated by `: `.
pub fn err_with_src<'a>(e: &'a (dyn Error + 'static)) -> ErrorWithSources<'a> {
    ErrorWithSources(e)
}

#[derive(Debug, Clone, Copy)]
pub struct ErrorWithSources<'a>(&'a (dyn Error + 'static));

impl fmt::Display for ErrorWithSources<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(cause) = source {
            write!(f, ": {cause}")?;
            source = cause.source();
        }

        Ok(())
    }
}
