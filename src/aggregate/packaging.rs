use crate::text::parse_count;
use crate::units::UnitMap;

/// `per_unit × count`, both parsed as integers. Non-numeric input and
/// products that overflow give 0.
pub fn derived_quantity(per_unit: &str, count: &str) -> i64 {
    parse_count(per_unit)
        .checked_mul(parse_count(count))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packaging<'a> {
    pub form: &'a str,
    pub quantity_per_pack: &'a str,
    pub unit: &'a str,
    pub inner_quantity: &'a str,
    pub total_quantity: &'a str,
    pub sub_unit_code: &'a str,
}

fn sub_unit_present(code: &str) -> bool {
    !code.is_empty() && !code.chars().all(|c| c == '0')
}

impl Packaging<'_> {
    /// `form + qty + unit + "(" + inner + unit + "×" + total [+ sub-unit name] + ")"`.
    pub fn display(&self, units: &UnitMap) -> String {
        let mut out = String::new();
        out.push_str(self.form);
        out.push_str(self.quantity_per_pack);
        out.push_str(self.unit);
        out.push('(');
        out.push_str(self.inner_quantity);
        out.push_str(self.unit);
        out.push('×');
        out.push_str(self.total_quantity);
        if sub_unit_present(self.sub_unit_code) {
            out.push_str(&units.resolve(self.sub_unit_code));
        }
        out.push(')');
        out
    }

    pub fn grouping_key(&self) -> String {
        format!("{}{}{}", self.form, self.inner_quantity, self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptp<'a>(sub_unit_code: &'a str) -> Packaging<'a> {
        Packaging {
            form: "PTP",
            quantity_per_pack: "10",
            unit: "錠",
            inner_quantity: "5",
            total_quantity: "2",
            sub_unit_code,
        }
    }

    #[test]
    fn display_omits_zero_sub_unit() {
        let units = UnitMap::from_pairs([("0", "never"), ("7", "箱")]);
        assert_eq!(ptp("0").display(&units), "PTP10錠(5錠×2)");
        assert_eq!(ptp("000").display(&units), "PTP10錠(5錠×2)");
        assert_eq!(ptp("").display(&units), "PTP10錠(5錠×2)");
        assert_eq!(ptp("7").display(&units), "PTP10錠(5錠×2箱)");
        // unknown codes are shown as-is
        assert_eq!(ptp("42").display(&units), "PTP10錠(5錠×242)");
    }

    #[test]
    fn grouping_key_ignores_pack_count() {
        let a = ptp("0");
        let b = Packaging { quantity_per_pack: "100", total_quantity: "20", ..ptp("7") };
        assert_eq!(a.grouping_key(), "PTP5錠");
        assert_eq!(a.grouping_key(), b.grouping_key());
    }

    #[test]
    fn quantity_strips_leading_zeros() {
        assert_eq!(derived_quantity("003", "007"), 21);
        assert_eq!(derived_quantity("003", "abc"), 0);
        assert_eq!(derived_quantity("", "5"), 0);
    }

    #[test]
    fn overflowing_quantity_degrades_to_zero() {
        assert_eq!(derived_quantity("9999999999", "9999999999"), 0);
        assert_eq!(derived_quantity("-9999999999", "9999999999"), 0);
        assert_eq!(derived_quantity("3037000499", "3037000499"), 9_223_372_030_926_249_001);
    }
}
