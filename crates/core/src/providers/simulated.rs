//! In-process demo dataset used when no remote provider is configured.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};

use super::{
    build_comparison, price_upgrade, Billing, CheckStatus, Contract, Customer, CustomerProvider,
    DeviceQuery, Eligibility, EligibilityCheck, InventoryProvider, PhoneLine, Plan,
    PlanComparison, Promotion, PromotionProvider, PromotionRef, ProviderError, RecommendationQuery,
    RecommendedDevice, Recommendations, StockedDevice, UpgradeCost, UpgradeCostRequest, Usage,
};

/// Renewal window, in days before contract end.
pub const RENEWAL_WINDOW_DAYS: i64 = 60;
const RECOMMENDATION_LIMIT: usize = 5;

fn offset(today: NaiveDate, days: i64) -> NaiveDate {
    let shifted = if days >= 0 {
        today.checked_add_days(Days::new(days.unsigned_abs()))
    } else {
        today.checked_sub_days(Days::new(days.unsigned_abs()))
    };
    shifted.unwrap_or(today)
}

// ---------------------------------------------------------------------------
// Customers and contracts
// ---------------------------------------------------------------------------

struct LineSeed {
    customer_id: &'static str,
    phone_number: &'static str,
    plan_id: &'static str,
    plan_name: &'static str,
    monthly_fee: i64,
    data_limit: &'static str,
    data_limit_gb: f64,
    voice_minutes: u32,
    started_days_ago: i64,
    ends_in_days: i64,
    months_used: u32,
    early_termination_fee: i64,
    device: &'static str,
    device_subsidy: i64,
}

const LINES: [LineSeed; 3] = [
    LineSeed {
        customer_id: "C123456",
        phone_number: "0912345678",
        plan_id: "PLAN_4G_999",
        plan_name: "4G 精選方案",
        monthly_fee: 999,
        data_limit: "50GB",
        data_limit_gb: 50.0,
        voice_minutes: 600,
        started_days_ago: 700,
        ends_in_days: 30,
        months_used: 23,
        early_termination_fee: 1000,
        device: "iPhone 14",
        device_subsidy: 10_000,
    },
    LineSeed {
        customer_id: "C123456",
        phone_number: "0987654321",
        plan_id: "PLAN_5G_599",
        plan_name: "5G 輕速方案",
        monthly_fee: 599,
        data_limit: "20GB",
        data_limit_gb: 20.0,
        voice_minutes: 300,
        started_days_ago: 400,
        ends_in_days: 330,
        months_used: 13,
        early_termination_fee: 5000,
        device: "單門號",
        device_subsidy: 0,
    },
    LineSeed {
        customer_id: "C987654",
        phone_number: "0923456789",
        plan_id: "PLAN_5G_1399",
        plan_name: "5G 飆速方案",
        monthly_fee: 1399,
        data_limit: "無限制",
        data_limit_gb: 100.0,
        voice_minutes: 999,
        started_days_ago: 680,
        ends_in_days: 50,
        months_used: 22,
        early_termination_fee: 2000,
        device: "Samsung Galaxy S23",
        device_subsidy: 15_000,
    },
];

fn customers() -> Vec<Customer> {
    let customer = |customer_id: &str,
                    id_number: &str,
                    name: &str,
                    phone: &str,
                    email: &str,
                    address: &str,
                    is_company_customer: bool,
                    credit_score: u32,
                    registration_date: &str| Customer {
        customer_id: customer_id.to_string(),
        id_number: id_number.to_string(),
        name: name.to_string(),
        phone: phone.to_string(),
        email: Some(email.to_string()),
        address: Some(address.to_string()),
        is_company_customer,
        credit_score,
        blacklist: false,
        registration_date: Some(registration_date.to_string()),
    };

    vec![
        customer(
            "C123456",
            "A123456789",
            "張三",
            "0912345678",
            "zhang@example.com",
            "台北市信義區信義路五段7號",
            true,
            85,
            "2020-01-01",
        ),
        customer(
            "C987654",
            "B987654321",
            "李四",
            "0923456789",
            "li@example.com",
            "新北市板橋區中山路一段161號",
            true,
            75,
            "2019-06-15",
        ),
        customer(
            "C111222",
            "C111222333",
            "王五",
            "0934567890",
            "wang@example.com",
            "台中市西屯區台灣大道三段99號",
            false,
            0,
            "2018-03-20",
        ),
    ]
}

/// Simulated CRM. Dates are computed relative to "today" so the demo lines stay inside or
/// outside the renewal window no matter when it runs.
#[derive(Clone, Debug, Default)]
pub struct SimulatedCustomerProvider {
    fixed_today: Option<NaiveDate>,
}

impl SimulatedCustomerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_today(today: NaiveDate) -> Self {
        Self { fixed_today: Some(today) }
    }

    fn today(&self) -> NaiveDate {
        self.fixed_today.unwrap_or_else(|| Utc::now().date_naive())
    }

    fn line(phone_number: &str) -> Option<&'static LineSeed> {
        LINES.iter().find(|line| line.phone_number == phone_number)
    }

    fn contract_for(&self, line: &LineSeed) -> Contract {
        let today = self.today();
        Contract {
            phone_number: line.phone_number.to_string(),
            plan_id: line.plan_id.to_string(),
            plan_name: line.plan_name.to_string(),
            monthly_fee: line.monthly_fee,
            data_limit: line.data_limit.to_string(),
            voice_minutes: line.voice_minutes,
            contract_start_date: offset(today, -line.started_days_ago),
            contract_end_date: offset(today, line.ends_in_days),
            contract_months: 24,
            months_used: line.months_used,
            early_termination_fee: line.early_termination_fee,
            device: line.device.to_string(),
            device_subsidy: line.device_subsidy,
            status: "active".to_string(),
        }
    }

    /// Applies the renewal rules to a contract and the line's billing state.
    pub fn evaluate(
        today: NaiveDate,
        contract: &Contract,
        billing: &Billing,
        blacklisted: bool,
    ) -> Eligibility {
        let days_to_expiry = (contract.contract_end_date - today).num_days();
        let mut details = Vec::with_capacity(3);

        let expiry = if days_to_expiry < 0 {
            (CheckStatus::Pass, "合約已到期，可立即續約".to_string())
        } else if days_to_expiry <= RENEWAL_WINDOW_DAYS {
            (CheckStatus::Pass, format!("合約將於 {days_to_expiry} 天後到期，符合續約條件"))
        } else {
            (
                CheckStatus::Fail,
                format!(
                    "合約還有 {days_to_expiry} 天才到期，需在 {RENEWAL_WINDOW_DAYS} 天內才可續約"
                ),
            )
        };
        details.push(EligibilityCheck {
            item: "合約到期".to_string(),
            status: expiry.0,
            message: expiry.1,
        });

        details.push(if billing.outstanding_balance == 0 {
            EligibilityCheck {
                item: "帳單繳費".to_string(),
                status: CheckStatus::Pass,
                message: "無欠費記錄".to_string(),
            }
        } else {
            EligibilityCheck {
                item: "帳單繳費".to_string(),
                status: CheckStatus::Fail,
                message: format!("有欠費 ${}，請先繳清", billing.outstanding_balance),
            }
        });

        details.push(if blacklisted {
            EligibilityCheck {
                item: "信用狀況".to_string(),
                status: CheckStatus::Fail,
                message: "有黑名單記錄，無法續約".to_string(),
            }
        } else {
            EligibilityCheck {
                item: "信用狀況".to_string(),
                status: CheckStatus::Pass,
                message: "信用良好，無黑名單記錄".to_string(),
            }
        });

        let eligible = details.iter().all(|check| check.status == CheckStatus::Pass);
        Eligibility {
            eligible,
            reason: (if eligible { "符合續約資格" } else { "不符合續約資格" }).to_string(),
            details,
            contract_end_date: Some(contract.contract_end_date),
            days_to_expiry: Some(days_to_expiry),
        }
    }
}

#[async_trait]
impl CustomerProvider for SimulatedCustomerProvider {
    async fn find_customer(&self, id_number: &str) -> Result<Option<Customer>, ProviderError> {
        Ok(customers().into_iter().find(|customer| customer.id_number == id_number))
    }

    async fn list_numbers(&self, customer_id: &str) -> Result<Vec<PhoneLine>, ProviderError> {
        let today = self.today();
        Ok(LINES
            .iter()
            .filter(|line| line.customer_id == customer_id)
            .enumerate()
            .map(|(index, line)| PhoneLine {
                phone_number: line.phone_number.to_string(),
                plan_name: line.plan_name.to_string(),
                contract_status: "active".to_string(),
                contract_end_date: offset(today, line.ends_in_days),
                monthly_fee: line.monthly_fee,
                is_primary: index == 0,
            })
            .collect())
    }

    async fn get_contract(&self, phone_number: &str) -> Result<Option<Contract>, ProviderError> {
        Ok(Self::line(phone_number).map(|line| self.contract_for(line)))
    }

    async fn get_usage(&self, phone_number: &str) -> Result<Option<Usage>, ProviderError> {
        Ok(Self::line(phone_number).map(|line| Usage {
            phone_number: line.phone_number.to_string(),
            data_used_gb: (line.data_limit_gb * 0.6 * 100.0).round() / 100.0,
            data_limit_gb: line.data_limit_gb,
            voice_used_minutes: line.voice_minutes.min(320),
            voice_limit_minutes: line.voice_minutes,
            average_daily_data_mb: 1200,
        }))
    }

    async fn get_billing(&self, phone_number: &str) -> Result<Option<Billing>, ProviderError> {
        let today = self.today();
        Ok(Self::line(phone_number).map(|line| Billing {
            phone_number: line.phone_number.to_string(),
            current_month_fee: line.monthly_fee,
            outstanding_balance: 0,
            payment_history_good: true,
            last_payment_date: offset(today, -15),
        }))
    }

    async fn check_eligibility(
        &self,
        phone_number: &str,
        customer_id: &str,
    ) -> Result<Eligibility, ProviderError> {
        let line = Self::line(phone_number).filter(|line| line.customer_id == customer_id);
        let (Some(contract), Some(billing)) = (
            line.map(|line| self.contract_for(line)),
            self.get_billing(phone_number).await?,
        ) else {
            return Ok(Eligibility::no_contract());
        };

        let blacklisted = customers()
            .iter()
            .any(|customer| customer.customer_id == customer_id && customer.blacklist);
        Ok(Self::evaluate(self.today(), &contract, &billing, blacklisted))
    }
}

// ---------------------------------------------------------------------------
// Device inventory
// ---------------------------------------------------------------------------

struct DeviceSeed {
    device_id: &'static str,
    brand: &'static str,
    model: &'static str,
    storage: &'static str,
    color: &'static str,
    os: &'static str,
    price: i64,
    market_price: i64,
    screen_size: &'static str,
    camera: &'static str,
    chip: &'static str,
    released: (i32, u32, u32),
    is_flagship: bool,
    popularity: u32,
}

const DEVICES: [DeviceSeed; 8] = [
    DeviceSeed {
        device_id: "DEV001",
        brand: "Apple",
        model: "iPhone 15 Pro",
        storage: "256GB",
        color: "自然鈦金屬",
        os: "iOS",
        price: 36_900,
        market_price: 39_900,
        screen_size: "6.1",
        camera: "48MP 主鏡頭 + 12MP 超廣角 + 12MP 望遠",
        chip: "A17 Pro",
        released: (2023, 9, 22),
        is_flagship: true,
        popularity: 95,
    },
    DeviceSeed {
        device_id: "DEV002",
        brand: "Apple",
        model: "iPhone 15",
        storage: "128GB",
        color: "粉紅色",
        os: "iOS",
        price: 29_900,
        market_price: 32_900,
        screen_size: "6.1",
        camera: "48MP 主鏡頭 + 12MP 超廣角",
        chip: "A16 Bionic",
        released: (2023, 9, 22),
        is_flagship: false,
        popularity: 90,
    },
    DeviceSeed {
        device_id: "DEV003",
        brand: "Samsung",
        model: "Galaxy S24 Ultra",
        storage: "512GB",
        color: "鈦灰色",
        os: "Android",
        price: 42_900,
        market_price: 46_900,
        screen_size: "6.8",
        camera: "200MP 主鏡頭 + 12MP 超廣角 + 50MP 望遠 + 10MP 望遠",
        chip: "Snapdragon 8 Gen 3",
        released: (2024, 1, 17),
        is_flagship: true,
        popularity: 92,
    },
    DeviceSeed {
        device_id: "DEV004",
        brand: "Samsung",
        model: "Galaxy S24",
        storage: "256GB",
        color: "星燦紫",
        os: "Android",
        price: 26_900,
        market_price: 29_900,
        screen_size: "6.2",
        camera: "50MP 主鏡頭 + 12MP 超廣角 + 10MP 望遠",
        chip: "Exynos 2400",
        released: (2024, 1, 17),
        is_flagship: false,
        popularity: 85,
    },
    DeviceSeed {
        device_id: "DEV005",
        brand: "Google",
        model: "Pixel 8 Pro",
        storage: "256GB",
        color: "天青色",
        os: "Android",
        price: 32_900,
        market_price: 35_900,
        screen_size: "6.7",
        camera: "50MP 主鏡頭 + 48MP 超廣角 + 48MP 望遠",
        chip: "Google Tensor G3",
        released: (2023, 10, 4),
        is_flagship: true,
        popularity: 88,
    },
    DeviceSeed {
        device_id: "DEV006",
        brand: "Xiaomi",
        model: "小米 14 Pro",
        storage: "512GB",
        color: "鈦金屬",
        os: "Android",
        price: 28_900,
        market_price: 31_900,
        screen_size: "6.73",
        camera: "50MP 主鏡頭 + 50MP 超廣角 + 50MP 望遠",
        chip: "Snapdragon 8 Gen 3",
        released: (2023, 10, 26),
        is_flagship: true,
        popularity: 83,
    },
    DeviceSeed {
        device_id: "DEV007",
        brand: "OPPO",
        model: "Find X7 Ultra",
        storage: "256GB",
        color: "海洋藍",
        os: "Android",
        price: 35_900,
        market_price: 39_900,
        screen_size: "6.82",
        camera: "50MP 主鏡頭 + 50MP 超廣角 + 50MP 望遠 + 50MP 潛望式望遠",
        chip: "Snapdragon 8 Gen 3",
        released: (2024, 1, 8),
        is_flagship: true,
        popularity: 80,
    },
    DeviceSeed {
        device_id: "DEV008",
        brand: "Apple",
        model: "iPhone 14",
        storage: "128GB",
        color: "午夜色",
        os: "iOS",
        price: 23_900,
        market_price: 27_900,
        screen_size: "6.1",
        camera: "12MP 主鏡頭 + 12MP 超廣角",
        chip: "A15 Bionic",
        released: (2022, 9, 16),
        is_flagship: false,
        popularity: 78,
    },
];

/// `(store, [(device, quantity, reserved)])`
const STOCK: [(&str, [(&str, u32, u32); 8]); 3] = [
    (
        "STORE001",
        [
            ("DEV001", 5, 1),
            ("DEV002", 8, 2),
            ("DEV003", 3, 0),
            ("DEV004", 6, 1),
            ("DEV005", 2, 0),
            ("DEV006", 4, 0),
            ("DEV007", 1, 0),
            ("DEV008", 10, 3),
        ],
    ),
    (
        "STORE002",
        [
            ("DEV001", 3, 0),
            ("DEV002", 12, 4),
            ("DEV003", 2, 1),
            ("DEV004", 8, 2),
            ("DEV005", 0, 0),
            ("DEV006", 5, 1),
            ("DEV007", 2, 0),
            ("DEV008", 15, 5),
        ],
    ),
    (
        "STORE003",
        [
            ("DEV001", 4, 1),
            ("DEV002", 10, 3),
            ("DEV003", 1, 0),
            ("DEV004", 7, 1),
            ("DEV005", 3, 1),
            ("DEV006", 6, 2),
            ("DEV007", 0, 0),
            ("DEV008", 12, 4),
        ],
    ),
];

#[derive(Clone, Debug, Default)]
pub struct SimulatedInventoryProvider;

#[async_trait]
impl InventoryProvider for SimulatedInventoryProvider {
    async fn list_devices(&self, query: &DeviceQuery) -> Result<Vec<StockedDevice>, ProviderError> {
        let (_, levels) = STOCK
            .iter()
            .find(|(store_id, _)| *store_id == query.store_id)
            .ok_or_else(|| ProviderError::UnknownStore(query.store_id.clone()))?;

        let mut devices: Vec<StockedDevice> = levels
            .iter()
            .filter_map(|(device_id, quantity, reserved)| {
                let seed = DEVICES.iter().find(|seed| seed.device_id == *device_id)?;
                let os_matches = query
                    .os_filter
                    .as_deref()
                    .map_or(true, |os| seed.os.eq_ignore_ascii_case(os));
                let above_min = query.min_price.map_or(true, |min| seed.price >= min);
                let below_max = query.max_price.map_or(true, |max| seed.price <= max);
                if !(os_matches && above_min && below_max) {
                    return None;
                }

                let available = quantity.saturating_sub(*reserved);
                Some(StockedDevice {
                    device_id: seed.device_id.to_string(),
                    brand: seed.brand.to_string(),
                    model: seed.model.to_string(),
                    storage: seed.storage.to_string(),
                    color: seed.color.to_string(),
                    os: seed.os.to_string(),
                    price: seed.price,
                    market_price: seed.market_price,
                    total_quantity: *quantity,
                    reserved: *reserved,
                    available,
                    in_stock: available > 0,
                    screen_size: Some(seed.screen_size.to_string()),
                    camera: Some(seed.camera.to_string()),
                    chip: Some(seed.chip.to_string()),
                })
            })
            .collect();

        devices.sort_by(|left, right| right.available.cmp(&left.available));
        Ok(devices)
    }

    async fn recommend_devices(
        &self,
        query: &RecommendationQuery,
    ) -> Result<Recommendations, ProviderError> {
        recommend_devices_at(query, Utc::now().date_naive())
    }
}

/// Ranks the in-stock devices of one store that fit the budget and OS preference.
pub fn recommend_devices_at(
    query: &RecommendationQuery,
    today: NaiveDate,
) -> Result<Recommendations, ProviderError> {
    let (_, levels) = STOCK
        .iter()
        .find(|(store_id, _)| *store_id == query.store_id)
        .ok_or_else(|| ProviderError::UnknownStore(query.store_id.clone()))?;

    let mut picks: Vec<RecommendedDevice> = levels
        .iter()
        .filter_map(|(device_id, quantity, reserved)| {
            let seed = DEVICES.iter().find(|seed| seed.device_id == *device_id)?;
            let available = quantity.saturating_sub(*reserved);
            let wanted = seed.os.eq_ignore_ascii_case(&query.os_preference)
                && seed.price <= query.budget
                && query.is_flagship.map_or(true, |flagship| seed.is_flagship == flagship)
                && available > 0;
            wanted.then(|| RecommendedDevice {
                device_id: seed.device_id.to_string(),
                brand: seed.brand.to_string(),
                model: seed.model.to_string(),
                storage: seed.storage.to_string(),
                color: seed.color.to_string(),
                price: seed.price,
                market_price: seed.market_price,
                discount: seed.market_price - seed.price,
                is_flagship: seed.is_flagship,
                popularity_score: seed.popularity,
                available,
                recommendation_score: recommendation_score(seed, available, query.budget, today),
                screen_size: Some(seed.screen_size.to_string()),
                camera: Some(seed.camera.to_string()),
                chip: Some(seed.chip.to_string()),
            })
        })
        .collect();

    picks.sort_by(|left, right| right.recommendation_score.cmp(&left.recommendation_score));
    picks.truncate(RECOMMENDATION_LIMIT);
    let reason = recommendation_reason(query, picks.first());
    Ok(Recommendations { recommendations: picks, reason })
}

fn recommendation_score(seed: &DeviceSeed, available: u32, budget: i64, today: NaiveDate) -> u32 {
    let mut score = seed.popularity;
    // Devices that use most of the budget rank higher.
    if seed.price * 10 >= budget * 8 {
        score += 5;
    } else if seed.price * 10 >= budget * 6 {
        score += 3;
    }
    if seed.is_flagship {
        score += 3;
    }
    let (year, month, day) = seed.released;
    if let Some(released) = NaiveDate::from_ymd_opt(year, month, day) {
        let months_old = (today - released).num_days() / 30;
        if months_old < 6 {
            score += 5;
        } else if months_old < 12 {
            score += 2;
        }
    }
    if available >= 5 {
        score += 2;
    }
    score
}

fn recommendation_reason(query: &RecommendationQuery, top: Option<&RecommendedDevice>) -> String {
    let Some(top) = top else {
        return format!(
            "目前沒有符合條件的設備 (預算: {}, 系統: {})",
            query.budget, query.os_preference
        );
    };
    let mut reason = format!(
        "根據您的預算 ${} 和 {} 偏好，推薦 {} {}。",
        thousands(query.budget),
        query.os_preference,
        top.brand,
        top.model
    );
    if top.is_flagship {
        reason.push_str(" 這是旗艦機型，性能卓越。");
    }
    if top.discount > 0 {
        reason.push_str(&format!(" 目前特價中，省下 ${}。", thousands(top.discount)));
    }
    reason
}

fn thousands(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if amount < 0 {
        grouped.push('-');
    }
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    grouped
}

// ---------------------------------------------------------------------------
// Promotions and plans
// ---------------------------------------------------------------------------

struct PromotionSeed {
    promotion_id: &'static str,
    title: &'static str,
    description: &'static str,
    keywords: &'static [&'static str],
    benefits: &'static [&'static str],
    contract_types: &'static [&'static str],
    plans: &'static [&'static str],
    priority: u32,
}

const PROMOTIONS: [PromotionSeed; 6] = [
    PromotionSeed {
        promotion_id: "PROMO001",
        title: "5G 雙飽專案",
        description: "網內免費+上網吃到飽，最適合重度使用者",
        keywords: &["5G", "吃到飽", "網內免費", "無限上網", "高用量"],
        benefits: &["網內通話免費", "5G 上網吃到飽", "熱點分享 50GB", "免費來電答鈴"],
        contract_types: &["攜碼", "續約", "新申辦"],
        plans: &["PLAN001", "PLAN002"],
        priority: 10,
    },
    PromotionSeed {
        promotion_id: "PROMO002",
        title: "學生方案 專屬優惠",
        description: "年輕就是要划算！學生專屬超值方案",
        keywords: &["學生", "青年", "優惠", "便宜", "小資"],
        benefits: &["月租 $399 起", "20GB 上網", "網內免費", "贈送 LINE MUSIC 3個月"],
        contract_types: &["攜碼", "續約", "新申辦"],
        plans: &["PLAN003"],
        priority: 8,
    },
    PromotionSeed {
        promotion_id: "PROMO003",
        title: "攜碼加碼優惠",
        description: "攜碼來就送！超高額回饋等你拿",
        keywords: &["攜碼", "回饋", "優惠", "折扣", "加碼"],
        benefits: &["攜碼享 85 折", "加碼贈送 $3,000 購物金", "免收攜碼手續費", "保證原號移轉"],
        contract_types: &["攜碼"],
        plans: &["PLAN001", "PLAN002", "PLAN004"],
        priority: 9,
    },
    PromotionSeed {
        promotion_id: "PROMO004",
        title: "老客戶續約好禮",
        description: "感謝您的支持！續約享專屬優惠",
        keywords: &["續約", "老客戶", "回饋", "優惠", "忠誠"],
        benefits: &["續約 9 折優惠", "贈送 2,000 點回饋金", "免收續約手續費", "優先選購新機"],
        contract_types: &["續約"],
        plans: &["PLAN001", "PLAN002", "PLAN003", "PLAN004", "PLAN005"],
        priority: 7,
    },
    PromotionSeed {
        promotion_id: "PROMO005",
        title: "家庭共享方案",
        description: "全家一起省！多門號超值優惠",
        keywords: &["家庭", "共享", "多門號", "優惠", "省錢"],
        benefits: &["主門號 $999/月", "副門號 $499/月起", "共享 100GB 上網", "網內互打免費"],
        contract_types: &["攜碼", "續約", "新申辦"],
        plans: &["PLAN006"],
        priority: 6,
    },
    PromotionSeed {
        promotion_id: "PROMO006",
        title: "商務專案 企業優惠",
        description: "企業行動方案，通話+上網一次滿足",
        keywords: &["商務", "企業", "公司", "辦公", "通話"],
        benefits: &["市話+網內免費", "40GB 上網", "國際漫遊優惠", "專屬客服"],
        contract_types: &["新申辦", "續約"],
        plans: &["PLAN007"],
        priority: 5,
    },
];

struct PlanSeed {
    plan_id: &'static str,
    name: &'static str,
    monthly_fee: i64,
    contract_months: u32,
    data: &'static str,
    voice: &'static str,
    sms: u32,
    features: &'static [&'static str],
    suitable_for: &'static [&'static str],
    upgrade_benefits: &'static str,
}

const PLANS: [PlanSeed; 7] = [
    PlanSeed {
        plan_id: "PLAN001",
        name: "5G 極速飆網 1399",
        monthly_fee: 1399,
        contract_months: 30,
        data: "無限上網",
        voice: "網內免費",
        sms: 100,
        features: &["5G 上網吃到飽（降速至 5Mbps）", "網內通話免費", "網外/市話 300分鐘", "熱點分享 50GB"],
        suitable_for: &["重度使用者", "影音愛好者", "行動辦公"],
        upgrade_benefits: "享手機折扣 $12,000",
    },
    PlanSeed {
        plan_id: "PLAN002",
        name: "5G 暢遊方案 999",
        monthly_fee: 999,
        contract_months: 30,
        data: "50GB",
        voice: "網內免費",
        sms: 50,
        features: &["5G 上網 50GB", "網內通話免費", "網外/市話 200分鐘", "熱點分享 20GB"],
        suitable_for: &["中度使用者", "平衡型用戶"],
        upgrade_benefits: "享手機折扣 $8,000",
    },
    PlanSeed {
        plan_id: "PLAN003",
        name: "學生輕量包 399",
        monthly_fee: 399,
        contract_months: 24,
        data: "20GB",
        voice: "網內免費",
        sms: 30,
        features: &["4G/5G 上網 20GB", "網內通話免費", "網外/市話 100分鐘", "贈 LINE MUSIC 3個月"],
        suitable_for: &["學生", "輕度使用者", "小資族"],
        upgrade_benefits: "享手機折扣 $3,000",
    },
    PlanSeed {
        plan_id: "PLAN004",
        name: "經濟實惠 599",
        monthly_fee: 599,
        contract_months: 24,
        data: "30GB",
        voice: "網內免費",
        sms: 50,
        features: &["4G/5G 上網 30GB", "網內通話免費", "網外/市話 150分鐘", "熱點分享 10GB"],
        suitable_for: &["一般使用者", "經濟實惠"],
        upgrade_benefits: "享手機折扣 $5,000",
    },
    PlanSeed {
        plan_id: "PLAN005",
        name: "通話大戶 799",
        monthly_fee: 799,
        contract_months: 24,
        data: "40GB",
        voice: "網內+市話免費",
        sms: 100,
        features: &["4G/5G 上網 40GB", "網內+市話通話免費", "網外 200分鐘", "來電答鈴免費"],
        suitable_for: &["通話需求高", "業務人員"],
        upgrade_benefits: "享手機折扣 $6,000",
    },
    PlanSeed {
        plan_id: "PLAN006",
        name: "家庭共享 1699",
        monthly_fee: 1699,
        contract_months: 24,
        data: "100GB共享",
        voice: "網內互打免費",
        sms: 200,
        features: &["100GB 共享上網", "最多 4 門號共享", "網內互打免費", "副門號 $499/月起"],
        suitable_for: &["家庭用戶", "多門號需求"],
        upgrade_benefits: "每門號享手機折扣 $4,000",
    },
    PlanSeed {
        plan_id: "PLAN007",
        name: "商務精選 1199",
        monthly_fee: 1199,
        contract_months: 24,
        data: "40GB",
        voice: "市話+網內免費",
        sms: 150,
        features: &[
            "4G/5G 上網 40GB",
            "市話+網內通話免費",
            "網外 300分鐘",
            "國際漫遊優惠",
            "專屬客服專線",
        ],
        suitable_for: &["商務人士", "企業用戶"],
        upgrade_benefits: "享手機折扣 $7,000",
    },
];

fn owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}

/// Keyword scoring over the promotion catalogue. A contract type, when given, is a hard filter
/// that also boosts every promotion it admits.
fn score_promotion(seed: &PromotionSeed, query: &str, contract_type: Option<&str>) -> Option<u32> {
    let lowered = query.to_lowercase();
    let words: Vec<&str> = query.split_whitespace().collect();
    let mut score = 0;

    for keyword in seed.keywords {
        if lowered.contains(&keyword.to_lowercase()) {
            score += 10;
        }
    }
    if words.iter().any(|word| seed.title.contains(word)) {
        score += 5;
    }
    if words.iter().any(|word| seed.description.contains(word)) {
        score += 3;
    }
    if let Some(contract_type) = contract_type {
        if !seed.contract_types.contains(&contract_type) {
            return None;
        }
        score += 20;
    }

    (score > 0).then_some(score)
}

#[derive(Clone, Debug, Default)]
pub struct SimulatedPromotionProvider;

impl SimulatedPromotionProvider {
    fn plan(plan_id: &str) -> Option<Plan> {
        let seed = PLANS.iter().find(|seed| seed.plan_id == plan_id)?;
        let applicable_promotions = PROMOTIONS
            .iter()
            .filter(|promo| promo.plans.contains(&plan_id))
            .map(|promo| PromotionRef {
                promotion_id: promo.promotion_id.to_string(),
                title: promo.title.to_string(),
                benefits: owned(promo.benefits),
            })
            .collect();

        Some(Plan {
            plan_id: seed.plan_id.to_string(),
            name: seed.name.to_string(),
            monthly_fee: seed.monthly_fee,
            contract_months: seed.contract_months,
            data: seed.data.to_string(),
            voice: seed.voice.to_string(),
            sms: seed.sms,
            features: owned(seed.features),
            suitable_for: owned(seed.suitable_for),
            upgrade_benefits: Some(seed.upgrade_benefits.to_string()),
            applicable_promotions,
        })
    }
}

#[async_trait]
impl PromotionProvider for SimulatedPromotionProvider {
    async fn search_promotions(
        &self,
        query: &str,
        contract_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Promotion>, ProviderError> {
        let mut matched: Vec<Promotion> = PROMOTIONS
            .iter()
            .filter_map(|seed| {
                let relevance_score = score_promotion(seed, query, contract_type)?;
                Some(Promotion {
                    promotion_id: seed.promotion_id.to_string(),
                    title: seed.title.to_string(),
                    description: seed.description.to_string(),
                    keywords: owned(seed.keywords),
                    benefits: owned(seed.benefits),
                    contract_types: owned(seed.contract_types),
                    plans: owned(seed.plans),
                    priority: seed.priority,
                    relevance_score,
                })
            })
            .collect();

        matched.sort_by(|left, right| {
            (right.relevance_score, right.priority).cmp(&(left.relevance_score, left.priority))
        });
        matched.truncate(limit);
        Ok(matched)
    }

    async fn plan_details(&self, plan_id: &str) -> Result<Option<Plan>, ProviderError> {
        Ok(Self::plan(plan_id))
    }

    async fn compare(&self, plan_ids: &[String]) -> Result<PlanComparison, ProviderError> {
        let mut seen = BTreeMap::new();
        for plan_id in plan_ids {
            if let Some(plan) = Self::plan(plan_id) {
                seen.entry(plan_id.clone()).or_insert(plan);
            }
        }
        let plans: Vec<Plan> =
            plan_ids.iter().filter_map(|plan_id| seen.remove(plan_id)).collect();

        build_comparison(plans).ok_or_else(|| ProviderError::Rejected {
            provider: "promotion",
            operation: "compare_plans".to_string(),
            code: "NOT_FOUND".to_string(),
            message: "沒有找到有效的方案".to_string(),
        })
    }

    async fn calculate_upgrade_cost(
        &self,
        request: &UpgradeCostRequest,
    ) -> Result<Option<UpgradeCost>, ProviderError> {
        Ok(Self::plan(&request.new_plan_id).map(|plan| price_upgrade(&plan, request)))
    }
}
