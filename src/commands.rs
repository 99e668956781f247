//! Command execution.

use crate::Commands;
use colored::Colorize;
use danalink_client::{Config, PersistedPumpState};
use danalink_protocol::{crc16, CommandRegistry, EncryptionContext, Frame, PacketType, PinPair};

/// Executes a command and returns the formatted output.
pub fn execute(cmd: Commands, config: &Config) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Crc {
            data,
            generation,
            handshake,
        } => {
            let body = parse_hex(&data)?;
            let crc = crc16(&body, generation.into(), handshake);
            Ok(format!("{:04x}", crc))
        }

        Commands::Encode {
            device_name,
            opcode,
            payload,
            handshake,
        } => {
            let ctx = EncryptionContext::new(&device_name)?;
            let payload = match payload {
                Some(hex) => parse_hex(&hex)?,
                None => Vec::new(),
            };
            let frame = if handshake {
                ctx.encode_handshake(opcode, &payload)?
            } else {
                ctx.encode_command(opcode, &payload)?
            };
            Ok(hex::encode(frame))
        }

        Commands::Decode { device_name, data } => {
            let mut ctx = EncryptionContext::new(&device_name)?;
            let frame = Frame::from_bytes(&parse_hex(&data)?)?;
            let packet = ctx.decode_frame(&frame)?;

            let mut output = format!(
                "{} {}\n{} {:#04x}\n{} {}",
                "type:".bold(),
                packet.packet_type,
                "opcode:".bold(),
                packet.opcode,
                "payload:".bold(),
                hex::encode(&packet.payload)
            );
            if matches!(packet.packet_type, PacketType::Response | PacketType::Notify) {
                match CommandRegistry::new().parse(&packet) {
                    Ok(parsed) => output.push_str(&format!(
                        "\n{} {} (success: {})\n{} {:?}",
                        "name:".bold(),
                        parsed.name,
                        parsed.success,
                        "value:".bold(),
                        parsed.value
                    )),
                    Err(e) => output.push_str(&format!("\n{}: {}", "Warning".yellow(), e)),
                }
            }
            Ok(output)
        }

        Commands::Pin { pin1, pin2 } => {
            let pin = PinPair::parse(&pin1, &pin2)?;
            Ok(format!(
                "{} pin pair (pairing key {}, random pairing key {})",
                "Valid".green(),
                hex::encode(pin.pairing_key).cyan(),
                hex::encode(pin.random_pairing_key).cyan()
            ))
        }

        Commands::Config => Ok(serde_yaml::to_string(config)?),

        Commands::State { path, forget } => {
            let Some(mut state) = PersistedPumpState::load(&path)? else {
                return Ok(format!("No state stored at {}", path.display()).yellow().to_string());
            };
            if forget {
                state.forget_bond();
                state.save(&path)?;
                return Ok(format!("{} bond with {}", "Forgot".green(), state.device_name.cyan()));
            }

            let bonded = if state.is_bonded() {
                "bonded".green()
            } else {
                "not bonded".yellow()
            };
            Ok(format!(
                "{} ({})\n{}",
                state.device_name.cyan().bold(),
                bonded,
                state.to_json()?
            ))
        }
    }
}

/// Parses hex input, ignoring whitespace and `:` separators.
fn parse_hex(input: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let digits: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(digits.trim_start_matches("0x"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GenerationArg;
    use danalink_protocol::packet::handshake;

    const DEVICE_NAME: &str = "VJH00012FI";

    #[test]
    fn test_parse_hex_separators() {
        assert!(parse_hex("a5 5a:0x").is_err());
        assert_eq!(parse_hex("a5 5a:02").unwrap(), vec![0xA5, 0x5A, 0x02]);
        assert_eq!(parse_hex("0x0102").unwrap(), vec![0x01, 0x02]);
    }

    #[test]
    fn test_crc_matches_library() {
        let output = execute(
            Commands::Crc {
                data: "0100".into(),
                generation: GenerationArg::Rsv3,
                handshake: true,
            },
            &Config::default(),
        )
        .unwrap();
        let expected = crc16(&[0x01, 0x00], danalink_protocol::Generation::Generation2, true);
        assert_eq!(output, format!("{:04x}", expected));
    }

    #[test]
    fn test_encode_then_decode_pump_check() {
        let encoded = execute(
            Commands::Encode {
                device_name: DEVICE_NAME.into(),
                opcode: handshake::PUMP_CHECK,
                payload: None,
                handshake: true,
            },
            &Config::default(),
        )
        .unwrap();

        let decoded = execute(
            Commands::Decode {
                device_name: DEVICE_NAME.into(),
                data: encoded,
            },
            &Config::default(),
        )
        .unwrap();
        assert!(decoded.contains("ENCRYPTION_REQUEST"));
        assert!(decoded.contains(&hex::encode(DEVICE_NAME)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = execute(
            Commands::Decode {
                device_name: DEVICE_NAME.into(),
                data: "00112233".into(),
            },
            &Config::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_pin_validation() {
        let ok = execute(
            Commands::Pin {
                pin1: "010203040506".into(),
                pin2: "0a0b0c0a".into(),
            },
            &Config::default(),
        )
        .unwrap();
        assert!(ok.contains("010203040506"));

        let bad = execute(
            Commands::Pin {
                pin1: "010203040506".into(),
                pin2: "0a0b0c00".into(),
            },
            &Config::default(),
        );
        assert!(bad.unwrap_err().to_string().contains("checksum"));
    }

    #[test]
    fn test_config_yaml() {
        let output = execute(Commands::Config, &Config::default()).unwrap();
        assert!(output.contains("keepalive_secs: 30"));
        assert!(output.contains("request_timeout_ms: 5000"));
    }

    #[test]
    fn test_state_forget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pump.json");

        let missing = execute(
            Commands::State {
                path: path.clone(),
                forget: false,
            },
            &Config::default(),
        )
        .unwrap();
        assert!(missing.contains("No state stored"));

        let mut state = PersistedPumpState::new(DEVICE_NAME);
        state.pairing_key = vec![0x12, 0x34];
        state.save(&path).unwrap();

        execute(
            Commands::State {
                path: path.clone(),
                forget: true,
            },
            &Config::default(),
        )
        .unwrap();
        let reloaded = PersistedPumpState::load(&path).unwrap().unwrap();
        assert!(!reloaded.is_bonded());
        assert_eq!(reloaded.device_name, DEVICE_NAME);
    }
}
