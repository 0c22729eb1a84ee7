pub mod color;
pub mod grid;
pub mod processor;
pub mod style;

pub use color::Color;
pub use grid::{Cell, ClearLineMode, ClearScreenMode, Screen};
pub use processor::{AnsiEvent, AnsiProcessor};
pub use style::{StyledSegment, TextStyle};
