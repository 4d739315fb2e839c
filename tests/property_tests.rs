use academy_api::{
    entities::{coupon::DiscountType, order_item::ItemKind},
    services::{
        coupons::{compute_discount, AppliedCoupon},
        pricing::{compose_summary, AddOn, LineItem, TaxPolicy},
        scheduling::overlaps,
    },
};
use chrono::NaiveTime;
use proptest::prelude::*;
use rust_decimal::Decimal;
use uuid::Uuid;

fn discount_type() -> impl Strategy<Value = DiscountType> {
    prop_oneof![Just(DiscountType::Percentage), Just(DiscountType::FixedAmount)]
}

fn line() -> impl Strategy<Value = LineItem> {
    (
        prop_oneof![Just(ItemKind::Course), Just(ItemKind::Physical), Just(ItemKind::Program)],
        0i64..5_000_000,
        1i32..5,
    )
        .prop_map(|(kind, unit_price, quantity)| LineItem {
            item_id: Uuid::new_v4(),
            kind,
            title: "item".to_string(),
            unit_price,
            quantity,
        })
}

fn tax_policy() -> impl Strategy<Value = TaxPolicy> {
    prop_oneof![
        (0u32..=100).prop_map(|pct| TaxPolicy::Percentage(Decimal::new(i64::from(pct), 2))),
        (0i64..50_000).prop_map(TaxPolicy::Flat),
    ]
}

fn minute_of_day() -> impl Strategy<Value = NaiveTime> {
    (0u32..24, 0u32..60).prop_map(|(h, m)| NaiveTime::from_hms_opt(h, m, 0).unwrap())
}

proptest! {
    #[test]
    fn discount_stays_within_amount(
        kind in discount_type(),
        value in -1_000i64..10_000_000,
        amount in -1_000i64..10_000_000,
    ) {
        let discount = compute_discount(kind, value, amount);
        prop_assert!(discount >= 0);
        prop_assert!(discount <= amount.max(0));
    }

    #[test]
    fn percentage_discount_is_monotonic_in_amount(
        pct in 0i64..=100,
        amount in 0i64..10_000_000,
        extra in 0i64..1_000_000,
    ) {
        let smaller = compute_discount(DiscountType::Percentage, pct, amount);
        let larger = compute_discount(DiscountType::Percentage, pct, amount + extra);
        prop_assert!(smaller <= larger);
    }

    #[test]
    fn summary_totals_hold(
        lines in prop::collection::vec(line(), 1..6),
        discounts in prop::collection::vec(0i64..2_000_000, 0..3),
        add_on_prices in prop::collection::vec(0i64..200_000, 0..3),
        policy in tax_policy(),
        shipping in 0i64..100_000,
        wallet in prop::option::of(-100_000i64..10_000_000),
    ) {
        let coupons: Vec<AppliedCoupon> = discounts
            .iter()
            .enumerate()
            .map(|(i, d)| AppliedCoupon {
                coupon_id: Uuid::new_v4(),
                code: format!("C{}", i),
                discount_amount: *d,
            })
            .collect();
        let add_ons: Vec<AddOn> = add_on_prices
            .iter()
            .map(|price| AddOn {
                package_id: Uuid::new_v4(),
                title: "pack".to_string(),
                price: *price,
            })
            .collect();
        let has_physical = lines.iter().any(|l| l.kind == ItemKind::Physical);

        let summary = compose_summary(lines, add_ons, coupons, Vec::new(), policy, shipping, wallet);

        prop_assert!(summary.total_discount <= summary.original_amount);
        let discounted = summary.original_amount - summary.total_discount;
        prop_assert_eq!(
            summary.final_amount,
            discounted + summary.tax_amount + summary.add_on_total + summary.shipping_amount
        );
        prop_assert!(summary.tax_amount >= 0);
        prop_assert_eq!(summary.shipping_amount, if has_physical { shipping } else { 0 });
        prop_assert!(summary.wallet_applied >= 0);
        prop_assert!(summary.wallet_applied <= summary.final_amount);
        prop_assert!(summary.payable_amount >= 0);
        prop_assert_eq!(summary.payable_amount, summary.final_amount - summary.wallet_applied);
    }

    #[test]
    fn overlap_is_symmetric(
        a in minute_of_day(),
        b in minute_of_day(),
        c in minute_of_day(),
        d in minute_of_day(),
    ) {
        let (a_start, a_end) = if a <= b { (a, b) } else { (b, a) };
        let (b_start, b_end) = if c <= d { (c, d) } else { (d, c) };
        prop_assert_eq!(
            overlaps(a_start, a_end, b_start, b_end),
            overlaps(b_start, b_end, a_start, a_end)
        );
        // touching intervals never overlap
        prop_assert!(!overlaps(a_start, a_end, a_end, b_end.max(a_end)));
    }
}
