// SPDX-License-Identifier: MIT OR Apache-2.0

/// Write the information log.
#[macro_export]
macro_rules! info {
    ($err:ident, $($arg:tt)+) => {
        $crate::__log!(Info, $err, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__log!(Info; $($arg)+)
    };
}

/// Write the warning log.
///
/// The first form writes `$err` and its sources after the message.
#[macro_export]
macro_rules! warn {
    ($err:ident, $($arg:tt)+) => {
        $crate::__log!(Warn, $err, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__log!(Warn; $($arg)+)
    };
}

/// Write the error log.
///
/// The first form writes `$err` and its sources after the message.
#[macro_export]
macro_rules! error {
    ($err:ident, $($arg:tt)+) => {
        $crate::__log!(Error, $err, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__log!(Error; $($arg)+)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __log {
    ($level:ident, $err:ident, $($arg:tt)+) => {
        if let Some(l) = $crate::log::LOGGER.get() {
            if l.enabled($crate::log::Level::$level) {
                use std::io::Write;

                let mut e = l.entry($crate::log::Level::$level, std::file!(), std::line!());

                write!(e, $($arg)+).unwrap();
                e.write_chain(&$err);
                l.write(e);
            }
        }
    };
    ($level:ident; $($arg:tt)+) => {
        if let Some(l) = $crate::log::LOGGER.get() {
            if l.enabled($crate::log::Level::$level) {
                use std::io::Write;

                let mut e = l.entry($crate::log::Level::$level, std::file!(), std::line!());

                writeln!(e, $($arg)+).unwrap();
                l.write(e);
            }
        }
    };
}
