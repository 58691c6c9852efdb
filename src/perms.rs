//! Permission bit encoding
//!
//! Two textual forms are accepted for protection bits: the 9-character
//! `rwxrwxrwx` rendering (with `S`/`s` for setuid/setgid and `T`/`t` for the
//! sticky bit) and a `chmod`-style specification such as `ugo=r,ug=w` with
//! group selectors `u`/`g`/`o` and permission letters `r`/`w`/`x`/`S`/`T`.

use crate::status::Status;
use bitflags::bitflags;

bitflags! {
    /// Protection bits, matching the POSIX mode layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perms: u32 {
        const SETUID = 0o4000;
        const SETGID = 0o2000;
        const STICKY = 0o1000;
        const UREAD = 0o400;
        const UWRITE = 0o200;
        const UEXEC = 0o100;
        const GREAD = 0o040;
        const GWRITE = 0o020;
        const GEXEC = 0o010;
        const OREAD = 0o004;
        const OWRITE = 0o002;
        const OEXEC = 0o001;
    }
}

impl Perms {
    pub fn from_mode(mode: u32) -> Perms {
        Perms::from_bits_truncate(mode)
    }

    pub fn mode(self) -> u32 {
        self.bits()
    }

    /// Render as the 9-character `rwxrwxrwx` form.
    pub fn format(self) -> String {
        let mut out = String::with_capacity(9);
        for (read, write, exec, special, upper, lower) in [
            (Perms::UREAD, Perms::UWRITE, Perms::UEXEC, Perms::SETUID, 'S', 's'),
            (Perms::GREAD, Perms::GWRITE, Perms::GEXEC, Perms::SETGID, 'S', 's'),
            (Perms::OREAD, Perms::OWRITE, Perms::OEXEC, Perms::STICKY, 'T', 't'),
        ] {
            out.push(if self.contains(read) { 'r' } else { '-' });
            out.push(if self.contains(write) { 'w' } else { '-' });
            out.push(match (self.contains(exec), self.contains(special)) {
                (true, true) => lower,
                (false, true) => upper,
                (true, false) => 'x',
                (false, false) => '-',
            });
        }
        out
    }

    /// Parse either textual form.
    pub fn parse(text: &str) -> Result<Perms, Status> {
        if text.len() == 9 && !text.contains('=') {
            Perms::parse_rwx(text)
        } else {
            Perms::parse_spec(text)
        }
    }

    fn parse_rwx(text: &str) -> Result<Perms, Status> {
        let bytes = text.as_bytes();
        let mut perms = Perms::empty();
        let groups = [
            (Perms::UREAD, Perms::UWRITE, Perms::UEXEC, Perms::SETUID),
            (Perms::GREAD, Perms::GWRITE, Perms::GEXEC, Perms::SETGID),
            (Perms::OREAD, Perms::OWRITE, Perms::OEXEC, Perms::STICKY),
        ];
        for (i, (read, write, exec, special)) in groups.into_iter().enumerate() {
            match bytes[i * 3] {
                b'r' => perms |= read,
                b'-' => {}
                c => return Err(bad_char(c)),
            }
            match bytes[i * 3 + 1] {
                b'w' => perms |= write,
                b'-' => {}
                c => return Err(bad_char(c)),
            }
            match bytes[i * 3 + 2] {
                b'x' => perms |= exec,
                b's' | b't' => perms |= exec | special,
                b'S' | b'T' => perms |= special,
                b'-' => {}
                c => return Err(bad_char(c)),
            }
        }
        Ok(perms)
    }

    fn parse_spec(text: &str) -> Result<Perms, Status> {
        let mut perms = Perms::empty();
        for clause in text.split(',') {
            let Some((who, what)) = clause.split_once('=') else {
                return Err(Status::invalid(format!(
                    "bad permission clause '{clause}'"
                )));
            };
            let mut selected = [false; 3];
            for c in who.chars() {
                match c {
                    'u' => selected[0] = true,
                    'g' => selected[1] = true,
                    'o' => selected[2] = true,
                    c => return Err(bad_char(c as u8)),
                }
            }
            for c in what.chars() {
                let rows = [
                    (Perms::UREAD, Perms::UWRITE, Perms::UEXEC, Perms::SETUID),
                    (Perms::GREAD, Perms::GWRITE, Perms::GEXEC, Perms::SETGID),
                    (Perms::OREAD, Perms::OWRITE, Perms::OEXEC, Perms::STICKY),
                ];
                for (i, (read, write, exec, special)) in rows.into_iter().enumerate() {
                    if !selected[i] {
                        continue;
                    }
                    match c {
                        'r' => perms |= read,
                        'w' => perms |= write,
                        'x' => perms |= exec,
                        'S' | 'T' => perms |= special,
                        c => return Err(bad_char(c as u8)),
                    }
                }
            }
        }
        Ok(perms)
    }
}

fn bad_char(c: u8) -> Status {
    Status::invalid(format!("bad permission character '{}'", c as char))
}
