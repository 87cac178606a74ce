use anyhow::{Result, bail};
use remindly_core::{CITY_PRESETS, TimezoneSpec, parse_timezone};
use std::io::{self, Write};

use crate::config::init_config;
use crate::state::{profile_path, read_profile, write_profile};

fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush().ok();
    let mut s = String::new();
    io::stdin().read_line(&mut s)?;
    Ok(s.trim().to_string())
}

/// A preset number (1-based), a preset city, an offset or an IANA name.
/// Blank keeps `current`.
fn choose_timezone(answer: &str, current: TimezoneSpec) -> Result<TimezoneSpec> {
    let answer = answer.trim();
    if answer.is_empty() {
        return Ok(current);
    }
    if let Ok(n) = answer.parse::<usize>() {
        return match CITY_PRESETS.get(n.wrapping_sub(1)) {
            Some((_, hours)) => Ok(TimezoneSpec::Fixed(hours * 60)),
            None => bail!("no preset number {n}"),
        };
    }
    Ok(parse_timezone(answer)?)
}

pub fn run_setup() -> Result<()> {
    println!("remindly setup\n");
    let mut profile = read_profile()?;
    let current = profile.timezone_spec()?;

    println!("Часовой пояс (сейчас {current}):");
    for (i, (label, _)) in CITY_PRESETS.iter().enumerate() {
        println!("  {}) {}", i + 1, label);
    }
    let answer = prompt("Номер, смещение (+03:00) или Region/City; пусто оставит как есть")?;
    let tz = choose_timezone(&answer, current)?;

    profile.timezone = tz.to_string();
    if profile.created_at_utc.is_none() {
        profile.created_at_utc = Some(chrono::Utc::now().to_rfc3339());
    }
    write_profile(&profile)?;
    init_config()?;

    println!("\nWrote {}", profile_path()?.display());
    println!("\nNext:");
    println!("- remindly auth paste-openai-api-key   (optional, enables the model fallback)");
    println!("- remindly chat");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timezone_answers() {
        let msk = TimezoneSpec::Fixed(180);
        assert_eq!(choose_timezone("", msk).unwrap(), msk);
        assert_eq!(choose_timezone("1", msk).unwrap(), TimezoneSpec::Fixed(120));
        assert_eq!(choose_timezone("+05:30", msk).unwrap(), TimezoneSpec::Fixed(330));
        assert_eq!(choose_timezone("Омск", msk).unwrap(), TimezoneSpec::Fixed(360));
        assert!(choose_timezone("0", msk).is_err());
        assert!(choose_timezone("Марс", msk).is_err());
    }
}
