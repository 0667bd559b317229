#![no_main]

use std::io::Cursor;

use framestream::demux::annexb::AnnexBDemuxer;
use framestream::logging::LogContext;
use framestream::logging::LogsLevel;
use framestream::parser::Parser;
use framestream::parser::ReadStatus;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(demuxer) = AnnexBDemuxer::new(Cursor::new(data.to_vec())) else {
        return;
    };

    let mut parser = Parser::with_demuxer(LogContext::new(LogsLevel::None), Box::new(demuxer));
    while let Ok(ReadStatus::Ready) = parser.read() {
        if let Ok(unit) = parser.get() {
            let _ = parser.analyze(&unit);
        }
    }
    parser.close();
});
