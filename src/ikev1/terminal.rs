use std::{
    io::{self, BufRead, Write},
    mem,
    os::fd::{AsRawFd, RawFd},
};

use log::debug;

use super::Prompt;

/// Reads answers from the controlling terminal; secrets are typed without
/// echo.
pub struct TerminalPrompt;

impl TerminalPrompt {
    fn read(&self, prompt: &str, hidden: bool) -> io::Result<String> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(prompt.as_bytes())?;
        stdout.flush()?;
        let stdin = io::stdin();
        let _guard = if hidden {
            Some(EchoGuard::disable(stdin.as_raw_fd()))
        } else {
            None
        };
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "No input available",
            ));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

impl Prompt for TerminalPrompt {
    fn read_line(&mut self, prompt: &str) -> io::Result<String> {
        self.read(prompt, false)
    }

    fn read_secret(&mut self, prompt: &str) -> io::Result<String> {
        self.read(prompt, true)
    }
}

/// Turns off echo on a terminal until dropped. Does nothing if the file
/// descriptor is not a terminal.
struct EchoGuard {
    fd: RawFd,
    original: Option<libc::termios>,
}

impl EchoGuard {
    fn disable(fd: RawFd) -> EchoGuard {
        let mut termios = mem::MaybeUninit::<libc::termios>::uninit();
        // SAFETY: tcgetattr only writes into the provided termios struct.
        if unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) } != 0 {
            debug!("Input is not a terminal, echo stays on");
            return EchoGuard { fd, original: None };
        }
        // SAFETY: tcgetattr succeeded and initialized the struct.
        let original = unsafe { termios.assume_init() };
        let mut silent = original;
        silent.c_lflag &= !libc::ECHO;
        silent.c_lflag |= libc::ECHONL;
        // SAFETY: silent is a valid termios copied from the terminal.
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &silent) } != 0 {
            debug!(
                "Failed to disable terminal echo: {}",
                io::Error::last_os_error()
            );
            return EchoGuard { fd, original: None };
        }
        EchoGuard {
            fd,
            original: Some(original),
        }
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        if let Some(ref original) = self.original {
            // SAFETY: original was read from this terminal by tcgetattr.
            if unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, original) } != 0 {
                debug!(
                    "Failed to restore terminal echo: {}",
                    io::Error::last_os_error()
                );
            }
        }
    }
}
