/// A musical event delivered to a module between blocks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    Controller { channel: u8, number: u8, value: u8 },
}

impl Event {
    pub fn channel(&self) -> u8 {
        match *self {
            Event::NoteOn { channel, .. }
            | Event::NoteOff { channel, .. }
            | Event::Controller { channel, .. } => channel,
        }
    }

    /// Parse raw MIDI bytes. Messages other than notes and CC are ignored.
    pub fn from_midi(message: &[u8]) -> Option<Self> {
        let (&status, data) = message.split_first()?;
        let channel = status & 0x0F;

        match (status & 0xF0, data) {
            // Note On with velocity 0 is a Note Off
            (0x90, &[note, 0, ..]) => Some(Event::NoteOff { channel, note }),
            (0x90, &[note, velocity, ..]) => Some(Event::NoteOn {
                channel,
                note,
                velocity,
            }),
            (0x80, &[note, _, ..]) => Some(Event::NoteOff { channel, note }),
            (0xB0, &[number, value, ..]) => Some(Event::Controller {
                channel,
                number,
                value,
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::NoteOn {
                channel,
                note,
                velocity,
            } => write!(f, "Ch{} Note On #{} vel={}", channel + 1, note, velocity),
            Event::NoteOff { channel, note } => write!(f, "Ch{} Note Off #{}", channel + 1, note),
            Event::Controller {
                channel,
                number,
                value,
            } => write!(f, "Ch{} CC #{} val={}", channel + 1, number, value),
        }
    }
}
