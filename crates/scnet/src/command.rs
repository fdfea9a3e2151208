//! Command channel: one ASCII line per call, one reply line per command
//!
//! Requests are `<Verb> <args...>\n`; replies are `OK [value]` or
//! `ERR <code> <message>`.

use std::fmt::Write as _;

use contracts::{
    FadeType, MpRefMode, Rgb, ScError, ScResult, ScState, SweepColourMode, SweepLine,
    SweepLineKind, View, WinGeom,
};

/// Longest accepted command line, sized for a hex LUT
pub const MAX_LINE: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// First line from a client: window id and the UDP port for patches
    Hello {
        window_id: u16,
        udp_port: u16,
        max_w: u16,
        max_h: u16,
    },
    Bye,
    Ping,
    SetWinPos { x: i16, y: i16 },
    SetWinGeom(WinGeom),
    SetWinParam { param: u16, arg1: u32, arg2: u32 },
    SetFade { rid: u8, fade_type: FadeType, rate: u16 },
    SetView(View),
    PanView { x: f32, y: f32, clear_trails: bool },
    SetRadarColour { rid: u8, colour: Rgb },
    SetRadarBright { rid: u8, bright: u8 },
    SetRadarLut { rid: u8, lut: Box<[u8; 256]> },
    ShowRadar { rid: u8, state: ScState },
    SetSource { source_id: u32, arg1: u32, arg2: u32 },
    SetRadarPosition { x: f32, y: f32, clear_trails: bool },
    SetRotation(f64),
    SetScaleFactor(u8),
    SetMpRefMode(MpRefMode),
    SetSweepLine(SweepLine),
    Clear,
    SetParam { name: String, value: String },
    GetParam { name: String },
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::Bye => "Bye",
            Self::Ping => "Ping",
            Self::SetWinPos { .. } => "SetWinPos",
            Self::SetWinGeom(_) => "SetWinGeom",
            Self::SetWinParam { .. } => "SetWinParam",
            Self::SetFade { .. } => "SetFade",
            Self::SetView(_) => "SetView",
            Self::PanView { .. } => "PanView",
            Self::SetRadarColour { .. } => "SetRadarColour",
            Self::SetRadarBright { .. } => "SetRadarBright",
            Self::SetRadarLut { .. } => "SetRadarLut",
            Self::ShowRadar { .. } => "ShowRadar",
            Self::SetSource { .. } => "SetSource",
            Self::SetRadarPosition { .. } => "SetRadarPosition",
            Self::SetRotation(_) => "SetRotation",
            Self::SetScaleFactor(_) => "SetScaleFactor",
            Self::SetMpRefMode(_) => "SetMpRefMode",
            Self::SetSweepLine(_) => "SetSweepLine",
            Self::Clear => "Clear",
            Self::SetParam { .. } => "SetParam",
            Self::GetParam { .. } => "GetParam",
        }
    }

    /// Encode as a newline terminated line
    pub fn to_line(&self) -> String {
        let args = match self {
            Self::Hello {
                window_id,
                udp_port,
                max_w,
                max_h,
            } => format!("{window_id} {udp_port} {max_w} {max_h}"),
            Self::Bye | Self::Ping | Self::Clear => String::new(),
            Self::SetWinPos { x, y } => format!("{x} {y}"),
            Self::SetWinGeom(g) => format!("{} {} {} {}", g.x, g.y, g.w, g.h),
            Self::SetWinParam { param, arg1, arg2 } => format!("{param} {arg1} {arg2}"),
            Self::SetFade {
                rid,
                fade_type,
                rate,
            } => format!("{rid} {} {rate}", fade_type.as_u8()),
            Self::SetView(v) => format!("{} {} {} {}", v.x, v.y, v.w, v.h),
            Self::PanView { x, y, clear_trails } => format!("{x} {y} {}", *clear_trails as u8),
            Self::SetRadarColour { rid, colour } => format!("{rid} {:06x}", colour.as_u32()),
            Self::SetRadarBright { rid, bright } => format!("{rid} {bright}"),
            Self::SetRadarLut { rid, lut } => {
                let mut hex = String::with_capacity(512);
                for value in lut.iter() {
                    let _ = write!(hex, "{value:02x}");
                }
                format!("{rid} {hex}")
            }
            Self::ShowRadar { rid, state } => format!("{rid} {}", state.as_u8()),
            Self::SetSource {
                source_id,
                arg1,
                arg2,
            } => format!("{source_id} {arg1} {arg2}"),
            Self::SetRadarPosition { x, y, clear_trails } => {
                format!("{x} {y} {}", *clear_trails as u8)
            }
            Self::SetRotation(degs) => format!("{degs}"),
            Self::SetScaleFactor(f) => format!("{f}"),
            Self::SetMpRefMode(mode) => match mode {
                MpRefMode::Normal => "0".to_string(),
                MpRefMode::AdjustFromNorth => "1".to_string(),
            },
            Self::SetSweepLine(line) => format!(
                "{} {} {:06x}",
                sweep_kind_code(line.kind),
                sweep_mode_code(line.colour_mode),
                line.rgb
            ),
            Self::SetParam { name, value } => format!("{name} {value}"),
            Self::GetParam { name } => name.clone(),
        };
        if args.is_empty() {
            format!("{}\n", self.verb())
        } else {
            format!("{} {args}\n", self.verb())
        }
    }

    /// Parse one line, without the trailing newline
    pub fn parse(line: &str) -> ScResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() > MAX_LINE {
            return Err(ScError::protocol(format!("command line of {} bytes", line.len())));
        }
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        let mut args = Args::new(verb, rest);
        let command = match verb {
            "Hello" => Self::Hello {
                window_id: args.next()?,
                udp_port: args.next()?,
                max_w: args.next()?,
                max_h: args.next()?,
            },
            "Bye" => Self::Bye,
            "Ping" => Self::Ping,
            "Clear" => Self::Clear,
            "SetWinPos" => Self::SetWinPos {
                x: args.next()?,
                y: args.next()?,
            },
            "SetWinGeom" => Self::SetWinGeom(WinGeom::new(
                args.next()?,
                args.next()?,
                args.next()?,
                args.next()?,
            )),
            "SetWinParam" => Self::SetWinParam {
                param: args.next()?,
                arg1: args.next()?,
                arg2: args.next()?,
            },
            "SetFade" => Self::SetFade {
                rid: args.next()?,
                fade_type: FadeType::from_u8(args.next()?)?,
                rate: args.next()?,
            },
            "SetView" => Self::SetView(View::new(
                args.next()?,
                args.next()?,
                args.next()?,
                args.next()?,
            )),
            "PanView" => Self::PanView {
                x: args.next()?,
                y: args.next()?,
                clear_trails: args.next::<u8>()? != 0,
            },
            "SetRadarColour" => Self::SetRadarColour {
                rid: args.next()?,
                colour: Rgb::from_u32(args.hex()?),
            },
            "SetRadarBright" => Self::SetRadarBright {
                rid: args.next()?,
                bright: args.next()?,
            },
            "SetRadarLut" => Self::SetRadarLut {
                rid: args.next()?,
                lut: args.lut()?,
            },
            "ShowRadar" => Self::ShowRadar {
                rid: args.next()?,
                state: ScState::from_u8(args.next()?)?,
            },
            "SetSource" => Self::SetSource {
                source_id: args.next()?,
                arg1: args.next()?,
                arg2: args.next()?,
            },
            "SetRadarPosition" => Self::SetRadarPosition {
                x: args.next()?,
                y: args.next()?,
                clear_trails: args.next::<u8>()? != 0,
            },
            "SetRotation" => Self::SetRotation(args.next()?),
            "SetScaleFactor" => Self::SetScaleFactor(args.next()?),
            "SetMpRefMode" => Self::SetMpRefMode(match args.next::<u8>()? {
                0 => MpRefMode::Normal,
                1 => MpRefMode::AdjustFromNorth,
                other => return Err(ScError::protocol(format!("mp ref mode {other}"))),
            }),
            "SetSweepLine" => Self::SetSweepLine(SweepLine {
                kind: sweep_kind_from(args.next()?)?,
                colour_mode: sweep_mode_from(args.next()?)?,
                rgb: args.hex()?,
            }),
            "SetParam" => {
                let name = args.word()?.to_string();
                let value = args.rest().to_string();
                if value.is_empty() {
                    return Err(ScError::protocol("SetParam without a value"));
                }
                Self::SetParam { name, value }
            }
            "GetParam" => Self::GetParam {
                name: args.word()?.to_string(),
            },
            "" => return Err(ScError::protocol("empty command line")),
            other => return Err(ScError::protocol(format!("unknown verb '{other}'"))),
        };
        args.finish()?;
        Ok(command)
    }
}

struct Args<'a> {
    verb: &'a str,
    rest: &'a str,
}

impl<'a> Args<'a> {
    fn new(verb: &'a str, rest: &'a str) -> Self {
        Self { verb, rest }
    }

    fn word(&mut self) -> ScResult<&'a str> {
        let rest = self.rest.trim_start();
        if rest.is_empty() {
            return Err(ScError::protocol(format!("{}: missing argument", self.verb)));
        }
        let (word, tail) = rest.split_once(' ').unwrap_or((rest, ""));
        self.rest = tail;
        Ok(word)
    }

    fn next<T: std::str::FromStr>(&mut self) -> ScResult<T> {
        let word = self.word()?;
        word.parse()
            .map_err(|_| ScError::protocol(format!("{}: bad argument '{word}'", self.verb)))
    }

    fn hex(&mut self) -> ScResult<u32> {
        let word = self.word()?;
        u32::from_str_radix(word, 16)
            .map_err(|_| ScError::protocol(format!("{}: bad hex '{word}'", self.verb)))
    }

    fn lut(&mut self) -> ScResult<Box<[u8; 256]>> {
        let word = self.word()?;
        if word.len() != 512 {
            return Err(ScError::protocol(format!("{}: lut of {} hex digits", self.verb, word.len())));
        }
        let mut lut = Box::new([0u8; 256]);
        for (idx, slot) in lut.iter_mut().enumerate() {
            let pair = &word[idx * 2..idx * 2 + 2];
            *slot = u8::from_str_radix(pair, 16)
                .map_err(|_| ScError::protocol(format!("{}: bad lut digits '{pair}'", self.verb)))?;
        }
        Ok(lut)
    }

    fn rest(&mut self) -> &'a str {
        let rest = self.rest.trim();
        self.rest = "";
        rest
    }

    fn finish(self) -> ScResult<()> {
        if self.rest.trim().is_empty() {
            Ok(())
        } else {
            Err(ScError::protocol(format!("{}: trailing arguments", self.verb)))
        }
    }
}

fn sweep_kind_code(kind: SweepLineKind) -> u8 {
    match kind {
        SweepLineKind::Off => 0,
        SweepLineKind::Auto => 1,
    }
}

fn sweep_kind_from(code: u8) -> ScResult<SweepLineKind> {
    match code {
        0 => Ok(SweepLineKind::Off),
        1 => Ok(SweepLineKind::Auto),
        other => Err(ScError::protocol(format!("sweep line kind {other}"))),
    }
}

fn sweep_mode_code(mode: SweepColourMode) -> u8 {
    match mode {
        SweepColourMode::Offset => 0,
        SweepColourMode::Highest => 1,
        SweepColourMode::Replace => 2,
    }
}

fn sweep_mode_from(code: u8) -> ScResult<SweepColourMode> {
    match code {
        0 => Ok(SweepColourMode::Offset),
        1 => Ok(SweepColourMode::Highest),
        2 => Ok(SweepColourMode::Replace),
        other => Err(ScError::protocol(format!("sweep colour mode {other}"))),
    }
}

/// Reply to one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(Option<String>),
    Err { code: i32, message: String },
}

impl Reply {
    pub fn from_result(result: ScResult<Option<String>>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(err) => Self::Err {
                code: err.code(),
                message: err.to_string(),
            },
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            Self::Ok(None) => "OK\n".to_string(),
            Self::Ok(Some(value)) => format!("OK {value}\n"),
            Self::Err { code, message } => {
                // one line per reply
                format!("ERR {code} {}\n", message.replace('\n', " "))
            }
        }
    }

    pub fn parse(line: &str) -> ScResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "OK" {
            return Ok(Self::Ok(None));
        }
        if let Some(value) = line.strip_prefix("OK ") {
            return Ok(Self::Ok(Some(value.to_string())));
        }
        if let Some(rest) = line.strip_prefix("ERR ") {
            let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
            let code = code
                .parse()
                .map_err(|_| ScError::protocol(format!("bad error code in '{line}'")))?;
            return Ok(Self::Err {
                code,
                message: message.to_string(),
            });
        }
        Err(ScError::protocol(format!("unrecognised reply '{line}'")))
    }

    pub fn into_result(self) -> ScResult<Option<String>> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Err { code, message } => Err(ScError::from_code(code, message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_verb_then_args() {
        let line = Command::SetWinGeom(WinGeom::new(-4, 8, 640, 480)).to_line();
        assert_eq!(line, "SetWinGeom -4 8 640 480\n");
        assert_eq!(Command::Ping.to_line(), "Ping\n");
        let parsed = Command::parse(&line).unwrap();
        assert_eq!(parsed, Command::SetWinGeom(WinGeom::new(-4, 8, 640, 480)));
    }

    #[test]
    fn every_control_call_survives_a_line() {
        let mut lut = Box::new([0u8; 256]);
        for (i, v) in lut.iter_mut().enumerate() {
            *v = 255 - i as u8;
        }
        let commands = vec![
            Command::Hello {
                window_id: 3,
                udp_port: 5000,
                max_w: 512,
                max_h: 256,
            },
            Command::SetFade {
                rid: 1,
                fade_type: FadeType::Sweep,
                rate: 20,
            },
            Command::SetView(View::new(1.5, -2.0, 1000.0, 750.0)),
            Command::PanView {
                x: 10.0,
                y: 20.0,
                clear_trails: true,
            },
            Command::SetRadarColour {
                rid: 0,
                colour: Rgb::from_u32(0x12ab34),
            },
            Command::SetRadarLut { rid: 0, lut },
            Command::ShowRadar {
                rid: 1,
                state: ScState::Hidden,
            },
            Command::SetSweepLine(SweepLine::auto(SweepColourMode::Offset, 0x00ff00)),
            Command::SetMpRefMode(MpRefMode::AdjustFromNorth),
            Command::SetParam {
                name: "clear_value".into(),
                value: "12".into(),
            },
            Command::GetParam {
                name: "tables_valid".into(),
            },
        ];
        for command in commands {
            assert_eq!(Command::parse(&command.to_line()).unwrap(), command);
        }
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(Command::parse("").is_err());
        assert!(Command::parse("Explode 1 2").is_err());
        assert!(Command::parse("SetWinPos 1").is_err());
        assert!(Command::parse("SetWinPos 1 two").is_err());
        assert!(Command::parse("SetWinPos 1 2 3").is_err());
        assert!(Command::parse("ShowRadar 0 9").is_err());
        assert!(Command::parse("SetRadarLut 0 abcd").is_err());
    }

    #[test]
    fn replies_keep_error_class() {
        let reply = Reply::from_result(Err(ScError::not_supported("set_rotation_degs", "bitmap")));
        let parsed = Reply::parse(&reply.to_line()).unwrap();
        assert!(parsed.into_result().unwrap_err().is_not_supported());

        let parsed = Reply::parse("OK 42").unwrap();
        assert_eq!(parsed.into_result().unwrap(), Some("42".to_string()));
        assert!(Reply::parse("MAYBE").is_err());
    }
}
