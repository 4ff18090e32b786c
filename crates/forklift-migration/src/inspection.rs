//! Guest inspection report published by the conversion worker
//!
//! ```xml
//! <v2v-inspection>
//!   <operatingsystem>
//!     <name>windows</name>
//!     <distro>windows</distro>
//!     <osinfo>win2k19</osinfo>
//!     <arch>x86_64</arch>
//!   </operatingsystem>
//! </v2v-inspection>
//! ```

use serde::Deserialize;

use forklift_common::Error;

/// Operating system found in the guest
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct OperatingSystem {
    /// Family name (`linux`, `windows`)
    #[serde(default)]
    pub name: String,
    /// Distribution
    #[serde(default)]
    pub distro: String,
    /// libosinfo short id (`rhel9.2`, `win2k19`)
    #[serde(default)]
    pub osinfo: String,
    /// Architecture
    #[serde(default)]
    pub arch: String,
}

#[derive(Deserialize)]
struct Report {
    operatingsystem: OperatingSystem,
}

/// Which customization branch runs after conversion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsFamily {
    /// Windows guests
    Windows,
    /// Everything else
    Linux,
}

impl OsFamily {
    /// Family of an osinfo id: any `win`, in any case, means Windows
    pub fn of(osinfo: &str) -> Self {
        if osinfo.to_ascii_lowercase().contains("win") {
            OsFamily::Windows
        } else {
            OsFamily::Linux
        }
    }

    /// Directory of the first-boot customization scripts for this family
    pub fn scripts(self) -> &'static str {
        match self {
            OsFamily::Windows => "/scripts/windows",
            OsFamily::Linux => "/scripts/linux",
        }
    }
}

impl OperatingSystem {
    /// Customization branch
    pub fn family(&self) -> OsFamily {
        OsFamily::of(&self.osinfo)
    }
}

/// Parse an inspection report
pub fn parse(xml: &str) -> Result<OperatingSystem, Error> {
    quick_xml::de::from_str::<Report>(xml)
        .map(|r| r.operatingsystem)
        .map_err(|e| Error::serialization_for_kind("inspection", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const WINDOWS: &str = r#"<?xml version="1.0"?>
<v2v-inspection>
  <program>virt-v2v-inspector</program>
  <operatingsystem>
    <name>windows</name>
    <distro>windows</distro>
    <osinfo>win2k19</osinfo>
    <arch>x86_64</arch>
    <hostname>dc01</hostname>
  </operatingsystem>
</v2v-inspection>"#;

    #[test]
    fn parses_operating_system() {
        let os = parse(WINDOWS).unwrap();
        assert_eq!(os.osinfo, "win2k19");
        assert_eq!(os.arch, "x86_64");
        assert_eq!(os.family(), OsFamily::Windows);
        assert_eq!(os.family().scripts(), "/scripts/windows");
    }

    #[rstest]
    #[case("win2k19", OsFamily::Windows)]
    #[case("WIN10", OsFamily::Windows)]
    #[case("Win11", OsFamily::Windows)]
    #[case("rhel9.2", OsFamily::Linux)]
    #[case("ubuntu22.04", OsFamily::Linux)]
    #[case("", OsFamily::Linux)]
    fn win_substring_selects_windows(#[case] osinfo: &str, #[case] expected: OsFamily) {
        assert_eq!(OsFamily::of(osinfo), expected);
    }

    #[test]
    fn missing_os_is_an_error() {
        let err = parse("<v2v-inspection><program>x</program></v2v-inspection>").unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
