//! Structure used to pass control messages to the client from its command line
//! (one json object per line on stdin).
//!
//! ```text
//! {"param": 1, "iValue1": 2, "fValue": 0.5}      gain for client 2 in my mix
//! {"param": 5, "sValue": "auto"}                  let the client size its buffer
//! {"param": 21, "sValue": "jam.example.com:7891"} connect
//! ```
use num::FromPrimitive;
use serde_json::json;
use simple_error::bail;
use std::fmt;

use crate::common::box_error::BoxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum JamParam {
    /// iValue1: whose channel, fValue: gain 0..1
    SetGain = 1,
    /// iValue1: whose channel, fValue: pan -1..1
    SetPan = 2,
    /// iValue1: whose channel, iValue2: 1 muted
    SetMute = 3,
    /// iValue1: whose channel, iValue2: 1 soloed
    SetSolo = 4,
    /// iValue1: frames, or sValue "auto"
    SetBufferCapacity = 5,
    /// same as above, for the server side buffer holding my audio
    SetServerBufferCapacity = 6,
    /// sValue: host:port
    Connect = 21,
    Disconnect = 22,
    ResetAudio = 23,
    StopAudio = 24,
    /// ask for a status report right now
    GetStatus = 25,
}

pub struct ParamMessage {
    pub param: JamParam,
    pub ivalue_1: i64,
    pub ivalue_2: i64,
    pub fvalue: f64,
    pub svalue: String,
}

impl ParamMessage {
    pub fn new(param: JamParam, ival1: i64, ival2: i64, fval: f64, sval: &str) -> ParamMessage {
        ParamMessage {
            param: param,
            ivalue_1: ival1,
            ivalue_2: ival2,
            fvalue: fval,
            svalue: String::from(sval),
        }
    }
    pub fn as_json(&self) -> serde_json::Value {
        json!({
          "param": self.param as i64,
          "iValue1": self.ivalue_1,
          "iValue2": self.ivalue_2,
          "fValue": self.fvalue,
          "sValue": self.svalue,
        })
    }
    pub fn from_string(data: &str) -> Result<ParamMessage, BoxError> {
        let raw: serde_json::Value = serde_json::from_str(data)?;
        Self::from_json(&raw)
    }
    pub fn from_json(raw: &serde_json::Value) -> Result<ParamMessage, BoxError> {
        let code = match get_i64(raw, "param")? {
            Some(c) => c,
            None => bail!("no param in message"),
        };
        let param: JamParam = match FromPrimitive::from_i64(code) {
            Some(p) => p,
            None => bail!("unknown param {}", code),
        };
        let mut msg = ParamMessage::new(param, 0, 0, 0.0, "");
        if let Some(v) = get_i64(raw, "iValue1")? {
            msg.ivalue_1 = v;
        }
        if let Some(v) = get_i64(raw, "iValue2")? {
            msg.ivalue_2 = v;
        }
        match &raw["fValue"] {
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_f64() {
                    msg.fvalue = v;
                }
            }
            serde_json::Value::String(s) => msg.fvalue = str::parse(s)?,
            _ => (),
        }
        if let Some(s) = raw["sValue"].as_str() {
            msg.svalue = String::from(s);
        }
        Ok(msg)
    }
    /// "auto" in sValue asks for automatic sizing
    pub fn is_auto(&self) -> bool {
        self.svalue.eq_ignore_ascii_case("auto")
    }
}

fn get_i64(raw: &serde_json::Value, key: &str) -> Result<Option<i64>, BoxError> {
    match &raw[key] {
        serde_json::Value::Number(n) => Ok(n.as_i64()),
        serde_json::Value::String(s) => Ok(Some(str::parse(s)?)),
        _ => Ok(None),
    }
}

impl fmt::Display for ParamMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ param: {:?}, ival_1: {}, ival_2: {}, fval: {} sval: {} }}",
            self.param, self.ivalue_1, self.ivalue_2, self.fvalue, self.svalue
        )
    }
}
