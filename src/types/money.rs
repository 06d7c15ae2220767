//! Money Primitives
//!
//! 모든 금액은 통화별 minor unit 정수(i64)로 표현하고, 연산은 전부 checked.
//! 비율/이율/한도는 basis point(`Bps`, 10_000 = 100%)로 표현해서 부동소수점을 쓰지 않는다.

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// ISO-4217 통화 코드 (지원 통화만 허용)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency([u8; 3]);

/// (code, minor unit exponent)
const SUPPORTED_CURRENCIES: &[(&str, u32)] = &[
    ("IDR", 0),
    ("JPY", 0),
    ("USD", 2),
    ("EUR", 2),
    ("SGD", 2),
    ("GBP", 2),
    ("AUD", 2),
    ("CNY", 2),
];

impl Currency {
    /// 정산 기준 통화 (Indonesian Rupiah, whole rupiah)
    pub const IDR: Currency = Currency(*b"IDR");

    pub fn new(code: &str) -> EngineResult<Self> {
        let upper = code.trim().to_ascii_uppercase();
        if SUPPORTED_CURRENCIES.iter().any(|(c, _)| *c == upper) {
            let bytes = upper.as_bytes();
            Ok(Self([bytes[0], bytes[1], bytes[2]]))
        } else {
            Err(EngineError::Validation(format!("unsupported currency: {}", code)))
        }
    }

    pub fn as_str(&self) -> &str {
        // 생성자에서 ASCII만 허용
        std::str::from_utf8(&self.0).unwrap_or("???")
    }

    /// minor unit 자릿수 (USD = 2 → cents)
    pub fn exponent(&self) -> u32 {
        SUPPORTED_CURRENCIES
            .iter()
            .find(|(c, _)| *c == self.as_str())
            .map(|(_, e)| *e)
            .unwrap_or(0)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Currency::new(&value)
    }
}

impl From<Currency> for String {
    fn from(c: Currency) -> Self {
        c.as_str().to_string()
    }
}

/// Basis points (1/10_000)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bps(pub u32);

impl Bps {
    pub const ZERO: Bps = Bps(0);
    pub const ONE: Bps = Bps(10_000);

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Bps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

/// 금액 + 통화
///
/// # Design Decision
///
/// - amount는 minor unit 정수 → 반올림 오차 없음
/// - 다른 통화끼리의 연산은 ValidationError
/// - overflow/underflow는 `EngineError::Overflow` (wrap 금지)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    pub amount: i64,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: i64, currency: Currency) -> Self {
        Self { amount, currency }
    }

    /// IDR 금액
    pub fn idr(amount: i64) -> Self {
        Self { amount, currency: Currency::IDR }
    }

    pub fn zero(currency: Currency) -> Self {
        Self { amount: 0, currency }
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }

    pub fn is_positive(&self) -> bool {
        self.amount > 0
    }

    pub fn checked_add(self, other: Money) -> EngineResult<Money> {
        self.same_currency(&other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or(EngineError::Overflow("money addition"))?;
        Ok(Money { amount, currency: self.currency })
    }

    pub fn checked_sub(self, other: Money) -> EngineResult<Money> {
        self.same_currency(&other)?;
        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or(EngineError::Overflow("money subtraction"))?;
        Ok(Money { amount, currency: self.currency })
    }

    /// `amount × bps / 10_000` (floor)
    pub fn apply_bps(self, bps: Bps) -> EngineResult<Money> {
        Ok(Money {
            amount: mul_div_floor(self.amount, bps.0 as i64, Bps::ONE.0 as i64)?,
            currency: self.currency,
        })
    }

    fn same_currency(&self, other: &Money) -> EngineResult<()> {
        if self.currency != other.currency {
            return Err(EngineError::Validation(format!(
                "currency mismatch: {} vs {}",
                self.currency, other.currency
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// `a × b / d` (floor, i128 중간값)
///
/// 음수 입력은 허용하지 않음 (잔액/한도 계산 전용)
pub fn mul_div_floor(a: i64, b: i64, d: i64) -> EngineResult<i64> {
    if a < 0 || b < 0 || d <= 0 {
        return Err(EngineError::Overflow("mul_div on negative or zero divisor"));
    }
    let wide = (a as i128) * (b as i128) / (d as i128);
    i64::try_from(wide).map_err(|_| EngineError::Overflow("mul_div result"))
}

/// 원 통화 금액을 IDR로 환산 (invoice 생성 시 1회만)
///
/// `rate` = 원 통화 1 major unit 당 IDR. 결과는 whole rupiah,
/// banker's rounding (MidpointNearestEven).
pub fn convert_to_idr(original: Money, rate: Decimal) -> EngineResult<Money> {
    if rate <= Decimal::ZERO {
        return Err(EngineError::Validation("exchange rate must be positive".to_string()));
    }
    if original.amount <= 0 {
        return Err(EngineError::Validation("invoice amount must be positive".to_string()));
    }
    if original.currency == Currency::IDR {
        if rate != Decimal::ONE {
            return Err(EngineError::Validation("IDR invoices must use rate 1".to_string()));
        }
        return Ok(original);
    }

    let major = Decimal::new(original.amount, original.currency.exponent());
    let idr = major
        .checked_mul(rate)
        .ok_or(EngineError::Overflow("currency conversion"))?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven);
    let amount = idr.to_i64().ok_or(EngineError::Overflow("currency conversion"))?;
    if amount <= 0 {
        return Err(EngineError::Validation("converted amount rounds to zero".to_string()));
    }
    Ok(Money::idr(amount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_currency_parsing() {
        assert_eq!(Currency::new("usd").unwrap().as_str(), "USD");
        assert_eq!(Currency::new("USD").unwrap().exponent(), 2);
        assert_eq!(Currency::IDR.exponent(), 0);
        assert!(Currency::new("XXX").is_err());
    }

    #[test]
    fn test_checked_arithmetic() {
        let a = Money::idr(100);
        let b = Money::idr(40);
        assert_eq!(a.checked_add(b).unwrap().amount, 140);
        assert_eq!(a.checked_sub(b).unwrap().amount, 60);

        let overflow = Money::idr(i64::MAX).checked_add(Money::idr(1));
        assert!(matches!(overflow, Err(EngineError::Overflow(_))));

        let usd = Money::new(1, Currency::new("USD").unwrap());
        assert!(matches!(a.checked_add(usd), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_apply_bps_floors() {
        assert_eq!(Money::idr(100_000_000).apply_bps(Bps(9_000)).unwrap().amount, 90_000_000);
        assert_eq!(Money::idr(999).apply_bps(Bps(5_000)).unwrap().amount, 499);
        // i64 범위 근처에서도 i128 중간값으로 안전
        assert!(Money::idr(i64::MAX).apply_bps(Bps::ONE).is_ok());
    }

    #[test]
    fn test_convert_usd_to_idr() {
        // 1,234.56 USD × 15,500.5 = 19,136,297.28 → 19,136,297
        let usd = Money::new(123_456, Currency::new("USD").unwrap());
        let idr = convert_to_idr(usd, dec!(15500.5)).unwrap();
        assert_eq!(idr, Money::idr(19_136_297));
    }

    #[test]
    fn test_convert_rounds_half_even() {
        // 0.05 USD × 10 = 0.5 → 0 → 거부, 0.15 × 10 = 1.5 → 2
        let jpy_like = Money::new(15, Currency::new("USD").unwrap());
        assert_eq!(convert_to_idr(jpy_like, dec!(10)).unwrap().amount, 2);

        let tiny = Money::new(5, Currency::new("USD").unwrap());
        assert!(convert_to_idr(tiny, dec!(10)).is_err());
    }

    #[test]
    fn test_convert_rejects_bad_rate() {
        let usd = Money::new(100, Currency::new("USD").unwrap());
        assert!(convert_to_idr(usd, Decimal::ZERO).is_err());
        assert!(convert_to_idr(usd, dec!(-1)).is_err());
        assert!(convert_to_idr(Money::idr(100), dec!(2)).is_err());
        assert_eq!(convert_to_idr(Money::idr(100), Decimal::ONE).unwrap().amount, 100);
    }
}
